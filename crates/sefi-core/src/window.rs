use std::collections::{BTreeMap, BTreeSet};

use time::format_description::well_known::Iso8601;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime};

use crate::corpus::RelationshipRecord;
use crate::efta::{DATASET_MAX, DATASET_MIN};
use crate::SefiError;

pub const WINDOW_DAYS: i64 = 30;
pub const BATCH_MIN: usize = 20;
pub const BATCH_MAX: usize = 50;

/// A relationship record that survived selection, reduced to what a unit needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRef {
    pub document_id: String,
    pub document_number: u32,
    pub dataset: u8,
    pub date: Date,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedWindow {
    pub window_start: Date,
    pub refs: Vec<WindowRef>,
}

impl SelectedWindow {
    #[must_use]
    pub fn window_end(&self) -> Date {
        window_end(self.window_start)
    }

    #[must_use]
    pub fn document_ids(&self) -> BTreeSet<String> {
        self.refs.iter().map(|doc| doc.document_id.clone()).collect()
    }
}

#[must_use]
pub fn window_end(window_start: Date) -> Date {
    window_start.saturating_add(Duration::days(WINDOW_DAYS))
}

/// Accepts `YYYY-MM-DD`, a local ISO 8601 datetime, or one carrying an offset or `Z`.
#[must_use]
pub fn parse_record_date(value: &str) -> Option<Date> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(date) = Date::parse(value, format_description!("[year]-[month]-[day]")) {
        return Some(date);
    }
    if let Ok(datetime) = OffsetDateTime::parse(value, &Iso8601::DEFAULT) {
        return Some(datetime.date());
    }
    PrimitiveDateTime::parse(value, &Iso8601::DEFAULT).ok().map(PrimitiveDateTime::date)
}

/// Pick the earliest 30-day window holding at least [`BATCH_MIN`] unlocked documents and
/// return at most [`BATCH_MAX`] of them in record order.
///
/// Windows are anchored at the earliest usable date so the partition does not depend on call
/// order. A document id seen twice inside one window is taken once.
///
/// # Errors
/// Returns [`SefiError::NoUnitsAvailable`] when no window qualifies.
pub fn select_window(
    relationships: &[RelationshipRecord],
    locked: &BTreeSet<String>,
) -> Result<SelectedWindow, SefiError> {
    if relationships.is_empty() {
        return Err(SefiError::NoUnitsAvailable(
            "no relationship records loaded; decision_chain units cannot be generated".to_string(),
        ));
    }

    let candidates = usable_refs(relationships, locked);
    let Some(min_date) = candidates.iter().map(|doc| doc.date).min() else {
        return Err(SefiError::NoUnitsAvailable(
            "no unlocked relationship records with a usable document id and date".to_string(),
        ));
    };

    let mut buckets: BTreeMap<i64, (BTreeSet<String>, Vec<WindowRef>)> = BTreeMap::new();
    for doc in candidates {
        let index = (doc.date - min_date).whole_days() / WINDOW_DAYS;
        let (seen, members) = buckets.entry(index).or_default();
        if seen.insert(doc.document_id.clone()) {
            members.push(doc);
        }
    }

    for (index, (_, mut members)) in buckets {
        if members.len() >= BATCH_MIN {
            members.truncate(BATCH_MAX);
            let window_start = min_date.saturating_add(Duration::days(index * WINDOW_DAYS));
            tracing::debug!(
                window_start = %window_start,
                documents = members.len(),
                "selected decision chain window"
            );
            return Ok(SelectedWindow { window_start, refs: members });
        }
    }

    Err(SefiError::NoUnitsAvailable(format!(
        "no {WINDOW_DAYS}-day window holds at least {BATCH_MIN} unassigned documents"
    )))
}

/// Whether [`select_window`] would succeed, without materialising the batch.
#[must_use]
pub fn has_eligible_window(
    relationships: &[RelationshipRecord],
    locked: &BTreeSet<String>,
) -> bool {
    select_window(relationships, locked).is_ok()
}

pub(crate) fn usable_refs(relationships: &[RelationshipRecord], locked: &BTreeSet<String>) -> Vec<WindowRef> {
    relationships
        .iter()
        .filter_map(|record| {
            let (document_id, document_number) = record.document_id()?;
            if locked.contains(document_id) {
                return None;
            }
            let date = record.date().and_then(parse_record_date)?;
            let dataset = record.dataset().ok()?;
            if !(DATASET_MIN..=DATASET_MAX).contains(&dataset) {
                tracing::debug!(document_id, dataset, "skipping record with unknown dataset");
                return None;
            }
            Some(WindowRef {
                document_id: document_id.to_string(),
                document_number,
                dataset,
                date,
                extra: record.passthrough(),
            })
        })
        .collect()
}
