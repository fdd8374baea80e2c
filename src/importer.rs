//! Bulk import of events from external sources (calendar exports, other trackers).
//!
//! Records carrying an external id are imported at most once; re-running the same
//! import is a no-op. New event types are queued like any local write. Events are
//! written without a queued create, so the next sync sends them in batches.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::models::{EventLocal, EventTypeLocal, Properties, SourceType};
use crate::sync::SyncEngine;

const DEFAULT_COLOR: &str = "#8E8E93";
const DEFAULT_ICON: &str = "square.and.arrow.down";

/// One event as it appears in an import file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRecord {
    /// Event type name, matched case-insensitively against local event types.
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub is_all_day: bool,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub original_title: Option<String>,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub duplicates: usize,
    pub event_types_created: usize,
    pub failed: usize,
}

impl ImportReport {
    pub fn print_summary(&self) {
        println!("Import finished");
        println!("  Imported:            {}", self.imported);
        println!("  Skipped duplicates:  {}", self.duplicates);
        println!("  New event types:     {}", self.event_types_created);
        println!("  Failed:              {}", self.failed);
    }
}

pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<ImportRecord>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read import file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Import file {} is not a JSON array of events", path.display()))
}

/// Writes every new record locally. The upload phase of the next sync sends them.
pub fn import_events(engine: &SyncEngine, records: Vec<ImportRecord>) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    let mut event_types = engine.store().event_types()?;
    let mut seen: HashSet<String> = engine
        .store()
        .events()?
        .into_iter()
        .filter_map(|event| event.external_id)
        .collect();

    for record in records {
        if let Some(external_id) = &record.external_id {
            if !seen.insert(external_id.clone()) {
                tracing::debug!(external_id = %external_id, "Skipping already imported event");
                report.duplicates += 1;
                continue;
            }
        }

        let event_type_id = match event_types.iter().find(|et| et.matches_name(&record.event_type)) {
            Some(existing) => existing.id_local.clone(),
            None => {
                let created = EventTypeLocal::new(
                    record.event_type.trim().to_string(),
                    DEFAULT_COLOR.to_string(),
                    DEFAULT_ICON.to_string(),
                );
                engine.save_event_type(created.clone())?;
                report.event_types_created += 1;
                let id = created.id_local.clone();
                event_types.push(created);
                id
            }
        };

        let mut event = EventLocal {
            event_type_id_local: event_type_id,
            timestamp: record.timestamp,
            end_date: record.end_date,
            notes: record.notes,
            is_all_day: record.is_all_day,
            source_type: SourceType::Imported,
            external_id: record.external_id,
            original_title: record.original_title,
            ..EventLocal::default()
        };
        if let Err(e) = event.set_properties(&record.properties) {
            tracing::warn!(error = %e, "Failed to encode imported properties");
            report.failed += 1;
            continue;
        }

        engine.store().upsert(event)?;
        report.imported += 1;
    }

    tracing::info!(
        imported = report.imported,
        duplicates = report.duplicates,
        event_types_created = report.event_types_created,
        "Import complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_parses_with_defaults() {
        let raw = r#"[{"event_type": "Run", "timestamp": "2024-02-02T07:00:00Z", "external_id": "cal-1"}]"#;
        let records: Vec<ImportRecord> = serde_json::from_str(raw).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id.as_deref(), Some("cal-1"));
        assert!(!records[0].is_all_day);
        assert!(records[0].properties.is_empty());
    }

    #[test]
    fn test_read_records_reports_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(read_records(&path).is_err());
        assert!(read_records(dir.path().join("missing.json")).is_err());
    }
}
