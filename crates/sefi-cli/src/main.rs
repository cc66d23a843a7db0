use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sefi_api::{init_tracing, migrate_findings_db, SefiApi, SefiConfig, SubmitRequest};
use sefi_core::{UnitKind, WorkUnit};
use sefi_store_sqlite::SqliteFindingsStore;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sefi")]
#[command(about = "SEFI work unit CLI")]
struct Cli {
    /// YAML configuration file; `SEFI_*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Generate(GenerateArgs),
    Assign(AssignArgs),
    Complete(UnitFileArgs),
    Submit(SubmitArgs),
    Status,
    /// Findings citing one document.
    Findings(FindingsArgs),
    Coverage(CoverageArgs),
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long, default_value = "verify_finding")]
    kind: UnitKind,
    #[arg(long, default_value_t = 1)]
    count: usize,
    /// Write each unit to `<out-dir>/<unit_id>.json` as well as stdout.
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct UnitFileArgs {
    #[arg(long)]
    unit_file: PathBuf,
}

#[derive(Debug, Args)]
struct AssignArgs {
    #[arg(long)]
    unit_file: PathBuf,
    #[arg(long)]
    worker_id: String,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    #[arg(long)]
    unit_file: PathBuf,
    #[arg(long)]
    worker_id: String,
    #[arg(long)]
    result_file: PathBuf,
}

#[derive(Debug, Args)]
struct FindingsArgs {
    #[arg(long)]
    document_id: String,
}

#[derive(Debug, Args)]
struct CoverageArgs {
    #[arg(long, default_value = "verify_finding")]
    kind: UnitKind,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SefiConfig::load(cli.config.as_deref())?;
    init_tracing(&config.log_level)?;

    match cli.command {
        Command::Config { command: ConfigCommand::Show } => {
            emit_json(serde_json::to_value(&config)?)
        }
        Command::Db { command } => run_db(*command, &config),
        Command::Generate(args) => run_generate(&args, &SefiApi::open(&config)?),
        Command::Assign(args) => run_assign(&args, &SefiApi::open(&config)?),
        Command::Complete(args) => run_complete(&args, &SefiApi::open(&config)?),
        Command::Submit(args) => run_submit(&args, &SefiApi::open(&config)?),
        Command::Status => run_status(&SefiApi::open(&config)?),
        Command::Findings(args) => {
            let findings = SefiApi::open(&config)?.findings_for_document(&args.document_id)?;
            emit_json(serde_json::json!({
                "document_id": args.document_id,
                "count": findings.len(),
                "findings": findings
            }))
        }
        Command::Coverage(args) => {
            emit_json(serde_json::to_value(SefiApi::open(&config)?.coverage(args.kind)?)?)
        }
    }
}

fn run_db(command: DbCommand, config: &SefiConfig) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = SqliteFindingsStore::open(&config.findings_db_path)?.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) if args.dry_run => {
            let before = SqliteFindingsStore::open(&config.findings_db_path)?.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": true,
                "current_version": before.current_version,
                "target_version": before.target_version,
                "would_apply_versions": before.pending_versions
            }))
        }
        DbCommand::Migrate(_) => {
            let after = migrate_findings_db(&config.findings_db_path)?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "current_version": after.current_version,
                "target_version": after.target_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::IntegrityCheck => {
            let ok = SqliteFindingsStore::open(&config.findings_db_path)?.quick_check()?;
            emit_json(serde_json::json!({ "ok": ok }))
        }
    }
}

fn run_generate(args: &GenerateArgs, api: &SefiApi) -> Result<()> {
    if let Some(dir) = &args.out_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    let mut units = Vec::new();
    for _ in 0..args.count {
        let Some(unit) = api.next_unit(args.kind)? else {
            break;
        };
        if let Some(dir) = &args.out_dir {
            let path = dir.join(format!("{}.json", unit.unit_id));
            fs::write(&path, serde_json::to_string_pretty(&unit)?)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        units.push(unit);
    }

    emit_json(serde_json::json!({
        "kind": args.kind,
        "requested": args.count,
        "available": !units.is_empty(),
        "units": units
    }))
}

fn adopt_unit_file(api: &SefiApi, path: &Path) -> Result<WorkUnit> {
    let unit: WorkUnit = read_json(path)?;
    api.adopt(&unit)?;
    Ok(unit)
}

fn run_assign(args: &AssignArgs, api: &SefiApi) -> Result<()> {
    let unit = adopt_unit_file(api, &args.unit_file)?;
    api.assign(&unit.unit_id, &args.worker_id)?;
    emit_json(serde_json::json!({
        "unit_id": unit.unit_id,
        "worker_id": args.worker_id,
        "assigned": true
    }))
}

fn run_complete(args: &UnitFileArgs, api: &SefiApi) -> Result<()> {
    let unit = adopt_unit_file(api, &args.unit_file)?;
    api.complete(&unit.unit_id)?;
    emit_json(serde_json::json!({
        "unit_id": unit.unit_id,
        "completed": true,
        "next_unit_available": api.has_available(unit.kind())
    }))
}

fn run_submit(args: &SubmitArgs, api: &SefiApi) -> Result<()> {
    let unit = adopt_unit_file(api, &args.unit_file)?;
    let result: Value = read_json(&args.result_file)?;
    let response = api.submit(&SubmitRequest {
        unit_id: unit.unit_id,
        worker_id: args.worker_id.clone(),
        result,
    })?;
    if !response.accepted {
        tracing::warn!(errors = response.errors.len(), pii = response.pii_detected, "result rejected");
    }
    emit_json(serde_json::to_value(&response)?)
}

fn run_status(api: &SefiApi) -> Result<()> {
    emit_json(serde_json::to_value(api.status()?)?)
}
