use crate::SefiError;

pub const DATASET_MIN: u8 = 1;
pub const DATASET_MAX: u8 = 12;
/// Dataset holding images, video and audio. Never distributed.
pub const MEDIA_DATASET: u8 = 10;
/// Dataset assumed when a relationship record does not name one.
pub const DEFAULT_DATASET: u8 = 9;

const DOCUMENT_PREFIX: &str = "EFTA";
const DOCUMENT_DIGITS: usize = 8;
const URL_PREFIX: &str = "https://www.justice.gov/epstein/files/DataSet%20";
const URL_SUFFIX: &str = ".pdf";

pub const MEDIA_SUFFIXES: [&str; 18] = [
    ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".tiff", ".tif", ".mp4", ".avi", ".mov", ".mkv",
    ".wmv", ".flv", ".webm", ".mp3", ".wav", ".aac", ".flac",
];

/// Maps a numeric document id and dataset number to a document URL.
///
/// Implementations must not perform I/O; tests substitute stubs.
pub trait UrlResolver: Send + Sync {
    /// # Errors
    /// Returns [`SefiError::Validation`] when the pair cannot be mapped to a URL.
    fn resolve(&self, document_number: u32, dataset: u8) -> Result<String, SefiError>;
}

/// Formats the canonical public URL for a document.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalUrlResolver;

impl UrlResolver for CanonicalUrlResolver {
    fn resolve(&self, document_number: u32, dataset: u8) -> Result<String, SefiError> {
        build_url(document_number, dataset)
    }
}

/// Build `https://www.justice.gov/epstein/files/DataSet%20{N}/EFTA{NNNNNNNN}.pdf`.
///
/// # Errors
/// Returns [`SefiError::Validation`] when `dataset` is outside `1..=12` or the number does not
/// fit in eight digits.
pub fn build_url(document_number: u32, dataset: u8) -> Result<String, SefiError> {
    if !(DATASET_MIN..=DATASET_MAX).contains(&dataset) {
        return Err(SefiError::Validation(format!(
            "dataset MUST be between {DATASET_MIN} and {DATASET_MAX}, got {dataset}"
        )));
    }
    if document_number > 99_999_999 {
        return Err(SefiError::Validation(format!(
            "document number {document_number} does not fit in {DOCUMENT_DIGITS} digits"
        )));
    }
    Ok(format!("{URL_PREFIX}{dataset}/{}{URL_SUFFIX}", format_document_id(document_number)))
}

#[must_use]
pub fn format_document_id(document_number: u32) -> String {
    format!("{DOCUMENT_PREFIX}{document_number:08}")
}

#[must_use]
pub fn is_document_id(value: &str) -> bool {
    parse_document_id(value).is_some()
}

/// Numeric suffix of an `EFTA` + 8 digit identifier.
#[must_use]
pub fn parse_document_id(value: &str) -> Option<u32> {
    let digits = value.strip_prefix(DOCUMENT_PREFIX)?;
    if digits.len() != DOCUMENT_DIGITS || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Dataset number embedded in a canonical document URL, when the URL has the canonical shape
/// and the dataset is in range.
#[must_use]
pub fn parse_document_url(url: &str) -> Option<u8> {
    let rest = url.strip_prefix(URL_PREFIX)?;
    let (dataset, file) = rest.split_once('/')?;
    if dataset.is_empty() || !dataset.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let document_id = file.strip_suffix(URL_SUFFIX)?;
    if !is_document_id(document_id) {
        return None;
    }
    let dataset = dataset.parse::<u8>().ok()?;
    (DATASET_MIN..=DATASET_MAX).contains(&dataset).then_some(dataset)
}

#[must_use]
pub fn is_document_url(url: &str) -> bool {
    parse_document_url(url).is_some()
}

#[must_use]
pub fn has_media_suffix(value: &str) -> bool {
    let lowered = value.to_ascii_lowercase();
    MEDIA_SUFFIXES.iter().any(|suffix| lowered.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_zero_pads_document_number() -> Result<(), SefiError> {
        assert_eq!(
            build_url(39_186, 9)?,
            "https://www.justice.gov/epstein/files/DataSet%209/EFTA00039186.pdf"
        );
        Ok(())
    }

    #[test]
    fn build_url_rejects_out_of_range_dataset() {
        assert!(matches!(build_url(1, 0), Err(SefiError::Validation(_))));
        assert!(matches!(build_url(1, 13), Err(SefiError::Validation(_))));
        assert!(matches!(build_url(100_000_000, 1), Err(SefiError::Validation(_))));
    }

    #[test]
    fn document_id_requires_prefix_and_eight_digits() {
        assert_eq!(parse_document_id("EFTA00039186"), Some(39_186));
        assert_eq!(parse_document_id("EFTA0003918"), None);
        assert_eq!(parse_document_id("EFTA000391866"), None);
        assert_eq!(parse_document_id("efta00039186"), None);
        assert_eq!(parse_document_id("EFTA0003918a"), None);
        assert_eq!(parse_document_id("DOC00039186"), None);
    }

    #[test]
    fn document_url_round_trips_through_parser() -> Result<(), SefiError> {
        let url = build_url(12, 12)?;
        assert_eq!(parse_document_url(&url), Some(12));
        assert!(!is_document_url("https://www.justice.gov/epstein/files/DataSet%2013/EFTA00000012.pdf"));
        assert!(!is_document_url("https://www.justice.gov/epstein/files/DataSet%201/EFTA0000012.pdf"));
        assert!(!is_document_url("http://www.justice.gov/epstein/files/DataSet%201/EFTA00000012.pdf"));
        Ok(())
    }

    #[test]
    fn media_suffix_check_ignores_case() {
        assert!(has_media_suffix("EFTA00000001.JPG"));
        assert!(has_media_suffix("clip.webm"));
        assert!(!has_media_suffix("EFTA00000001"));
        assert!(!has_media_suffix("EFTA00000001.pdf"));
    }
}
