//! Structured pipeline events and the sinks that receive them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::schema::SchemaChange;
use crate::types::{Granularity, RunStatus};

/// Something operators or alerting should know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    FileCommitted {
        dataset: String,
        file: String,
        rows: u64,
        error_rows: u64,
        schema_version: u32,
    },
    FileFailed {
        dataset: String,
        file: String,
        kind: ErrorKind,
        reason: String,
    },
    LedgerConflict {
        dataset: String,
        file: String,
        committed_fingerprint: String,
        observed_fingerprint: String,
    },
    SchemaEvolved {
        dataset: String,
        version: u32,
        changes: Vec<SchemaChange>,
    },
    WindowRefreshed {
        dataset: String,
        entity_key: String,
        granularity: Granularity,
        window_start: DateTime<Utc>,
        source_record_count: u64,
    },
    LatenessViolation {
        dataset: String,
        entity_key: String,
        window_start: DateTime<Utc>,
        event_time: DateTime<Utc>,
        horizon_hours: u64,
    },
    AggregationInconsistency {
        dataset: String,
        window: String,
        message: String,
    },
    AnomalyRate {
        dataset: String,
        records: u64,
        anomalies: u64,
        rate: f64,
    },
    RunFinished {
        run_id: Uuid,
        dataset: String,
        status: RunStatus,
        records_processed: u64,
        errors: u64,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::FileCommitted { .. } => "file_committed",
            PipelineEvent::FileFailed { .. } => "file_failed",
            PipelineEvent::LedgerConflict { .. } => "ledger_conflict",
            PipelineEvent::SchemaEvolved { .. } => "schema_evolved",
            PipelineEvent::WindowRefreshed { .. } => "window_refreshed",
            PipelineEvent::LatenessViolation { .. } => "lateness_violation",
            PipelineEvent::AggregationInconsistency { .. } => "aggregation_inconsistency",
            PipelineEvent::AnomalyRate { .. } => "anomaly_rate",
            PipelineEvent::RunFinished { .. } => "run_finished",
        }
    }

    pub fn dataset(&self) -> &str {
        match self {
            PipelineEvent::FileCommitted { dataset, .. }
            | PipelineEvent::FileFailed { dataset, .. }
            | PipelineEvent::LedgerConflict { dataset, .. }
            | PipelineEvent::SchemaEvolved { dataset, .. }
            | PipelineEvent::WindowRefreshed { dataset, .. }
            | PipelineEvent::LatenessViolation { dataset, .. }
            | PipelineEvent::AggregationInconsistency { dataset, .. }
            | PipelineEvent::AnomalyRate { dataset, .. }
            | PipelineEvent::RunFinished { dataset, .. } => dataset,
        }
    }
}

/// Receiver of pipeline events. Emitting never fails the pipeline.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::FileCommitted {
                dataset,
                file,
                rows,
                error_rows,
                schema_version,
            } => tracing::info!(
                dataset = %dataset,
                file = %file,
                rows,
                error_rows,
                schema_version,
                "File committed"
            ),
            PipelineEvent::FileFailed {
                dataset,
                file,
                kind,
                reason,
            } => tracing::warn!(dataset = %dataset, file = %file, kind = %kind, reason = %reason, "File failed"),
            PipelineEvent::LedgerConflict {
                dataset,
                file,
                committed_fingerprint,
                observed_fingerprint,
            } => tracing::error!(
                dataset = %dataset,
                file = %file,
                committed = %committed_fingerprint,
                observed = %observed_fingerprint,
                "Ledger conflict: file overwritten in place"
            ),
            PipelineEvent::SchemaEvolved {
                dataset,
                version,
                changes,
            } => tracing::info!(
                dataset = %dataset,
                version,
                changes = changes.len(),
                "Schema evolved"
            ),
            PipelineEvent::WindowRefreshed {
                dataset,
                entity_key,
                granularity,
                window_start,
                source_record_count,
            } => tracing::debug!(
                dataset = %dataset,
                entity = %entity_key,
                granularity = %granularity,
                window_start = %window_start,
                source_record_count,
                "Window refreshed"
            ),
            PipelineEvent::LatenessViolation {
                dataset,
                entity_key,
                window_start,
                event_time,
                horizon_hours,
            } => tracing::warn!(
                dataset = %dataset,
                entity = %entity_key,
                window_start = %window_start,
                event_time = %event_time,
                horizon_hours,
                "Late row rejected"
            ),
            PipelineEvent::AggregationInconsistency {
                dataset,
                window,
                message,
            } => tracing::error!(dataset = %dataset, window = %window, message = %message, "Aggregation inconsistency"),
            PipelineEvent::AnomalyRate {
                dataset,
                records,
                anomalies,
                rate,
            } => tracing::info!(dataset = %dataset, records, anomalies, rate, "Anomaly rate"),
            PipelineEvent::RunFinished {
                run_id,
                dataset,
                status,
                records_processed,
                errors,
            } => tracing::info!(
                run_id = %run_id,
                dataset = %dataset,
                status = %status,
                records_processed,
                errors,
                "Run finished"
            ),
        }
    }
}

/// Appends one JSON object per event to a file.
#[derive(Debug)]
pub struct JsonlEventSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlEventSink {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Serialize)]
struct EventLine<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a PipelineEvent,
}

impl EventSink for JsonlEventSink {
    fn emit(&self, event: &PipelineEvent) {
        let line = match serde_json::to_string(&EventLine {
            at: Utc::now(),
            event,
        }) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize pipeline event");
                return;
            }
        };
        let Ok(mut file) = self.file.lock() else {
            tracing::warn!(path = %self.path.display(), "Event log lock poisoned");
            return;
        };
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to append pipeline event");
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events with the given [`PipelineEvent::name`].
    pub fn named(&self, name: &str) -> Vec<PipelineEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name() == name)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &PipelineEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn failed() -> PipelineEvent {
        PipelineEvent::FileFailed {
            dataset: "sensors".into(),
            file: "bad.csv".into(),
            kind: ErrorKind::PartialParseFailure,
            reason: "too many bad rows".into(),
        }
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(failed()).unwrap();
        assert_eq!(json["type"], "file_failed");
        assert_eq!(json["kind"], "partial_parse_failure");
        let back: PipelineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, failed());
    }

    #[test]
    fn test_memory_sink_filters_by_name() {
        let sink = MemoryEventSink::new();
        sink.emit(&failed());
        sink.emit(&PipelineEvent::AnomalyRate {
            dataset: "sensors".into(),
            records: 10,
            anomalies: 1,
            rate: 0.1,
        });
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.named("anomaly_rate").len(), 1);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemoryEventSink::new());
        let b = Arc::new(MemoryEventSink::new());
        let fanout = FanoutSink::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(TracingEventSink));
        assert_eq!(fanout.len(), 3);
        fanout.emit(&failed());
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/events.jsonl");
        let sink = JsonlEventSink::open(&path).unwrap();
        sink.emit(&failed());
        sink.emit(&failed());
        drop(sink);

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "file_failed");
        assert!(first["at"].is_string());
    }

    #[test]
    fn test_event_dataset_accessor() {
        assert_eq!(failed().dataset(), "sensors");
        assert_eq!(failed().name(), "file_failed");
    }
}
