use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of {accepted}; got `{got}`")]
    LogLevel { accepted: String, got: String },
    #[error("{field} must not be empty")]
    EmptyPath { field: &'static str },
}

/// Runtime settings. Defaults, then an optional YAML file, then `SEFI_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SefiConfig {
    pub data_dir: PathBuf,
    pub findings_db_path: PathBuf,
    pub corpus_db_path: PathBuf,
    pub claims_path: PathBuf,
    pub relationships_path: PathBuf,
    pub log_level: String,
}

impl Default for SefiConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            findings_db_path: data_dir.join("findings.db"),
            corpus_db_path: data_dir.join("sefi.db"),
            claims_path: data_dir.join("sample_claims.json"),
            relationships_path: data_dir.join("knowledge_graph_relationships.json"),
            data_dir,
            log_level: "info".to_string(),
        }
    }
}

impl SefiConfig {
    /// Load configuration from an optional YAML file and the process environment.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, or the result is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or is not a valid config document.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Override fields from `SEFI_*` variables supplied by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let path_vars: [(&str, &mut PathBuf); 5] = [
            ("SEFI_DATA_DIR", &mut self.data_dir),
            ("SEFI_FINDINGS_DB_PATH", &mut self.findings_db_path),
            ("SEFI_CORPUS_DB_PATH", &mut self.corpus_db_path),
            ("SEFI_CLAIMS_PATH", &mut self.claims_path),
            ("SEFI_RELATIONSHIPS_PATH", &mut self.relationships_path),
        ];
        for (key, field) in path_vars {
            if let Some(value) = lookup(key) {
                *field = PathBuf::from(value);
            }
        }
        if let Some(value) = lookup("SEFI_LOG_LEVEL") {
            self.log_level = value;
        }
    }

    /// Normalise `log_level` and reject empty paths.
    ///
    /// # Errors
    /// Returns [`ConfigError`] describing the first invalid field.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.log_level = normalize_log_level(&self.log_level)?;

        let paths = [
            ("data_dir", &self.data_dir),
            ("findings_db_path", &self.findings_db_path),
            ("corpus_db_path", &self.corpus_db_path),
            ("claims_path", &self.claims_path),
            ("relationships_path", &self.relationships_path),
        ];
        for (field, path) in paths {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::EmptyPath { field });
            }
        }
        Ok(())
    }
}

/// Map accepted spellings, including `WARNING` and `CRITICAL`, onto tracing filter levels.
///
/// # Errors
/// Returns [`ConfigError::LogLevel`] for anything else.
pub fn normalize_log_level(raw: &str) -> Result<String, ConfigError> {
    let lowered = raw.trim().to_ascii_lowercase();
    let level = match lowered.as_str() {
        "warning" => "warn",
        "critical" => "error",
        other => other,
    };
    if LOG_LEVELS.contains(&level) {
        Ok(level.to_string())
    } else {
        Err(ConfigError::LogLevel { accepted: LOG_LEVELS.join(", "), got: raw.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn defaults_live_under_data_dir() {
        let config = SefiConfig::default();
        assert_eq!(config.findings_db_path, PathBuf::from("data/findings.db"));
        assert_eq!(config.corpus_db_path, PathBuf::from("data/sefi.db"));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn log_level_accepts_legacy_spellings() {
        assert_eq!(normalize_log_level("INFO"), Ok("info".to_string()));
        assert_eq!(normalize_log_level("Warning"), Ok("warn".to_string()));
        assert_eq!(normalize_log_level("CRITICAL"), Ok("error".to_string()));
        assert!(matches!(normalize_log_level("verbose"), Err(ConfigError::LogLevel { .. })));
    }

    #[test]
    fn env_overrides_file_values() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sefi.yaml");
        fs::write(&path, "findings_db_path: /tmp/from-file.db\nlog_level: DEBUG\n")?;

        let mut config = SefiConfig::from_yaml_file(&path)?;
        let env: BTreeMap<&str, &str> =
            [("SEFI_LOG_LEVEL", "error"), ("SEFI_CLAIMS_PATH", "/srv/claims.json")].into();
        config.apply_env(|key| env.get(key).map(ToString::to_string));
        config.validate()?;

        assert_eq!(config.findings_db_path, PathBuf::from("/tmp/from-file.db"));
        assert_eq!(config.claims_path, PathBuf::from("/srv/claims.json"));
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.log_level, "error");
        Ok(())
    }

    #[test]
    fn unknown_keys_and_empty_paths_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sefi.yaml");
        fs::write(&path, "findings_db: x.db\n")?;
        assert!(SefiConfig::from_yaml_file(&path).is_err());

        let mut config = SefiConfig { data_dir: PathBuf::new(), ..SefiConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::EmptyPath { field: "data_dir" }));
        Ok(())
    }
}
