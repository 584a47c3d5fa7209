//! Pipeline metrics: plain counters fed by pipeline events.

use std::sync::Mutex;
use std::time::Instant;

use crate::events::{EventSink, PipelineEvent};
use crate::types::RunStatus;

/// Process-lifetime counters for files, rows, windows and runs.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub files_committed: u64,
    pub files_failed: u64,
    pub ledger_conflicts: u64,
    pub rows_ingested: u64,
    pub row_errors: u64,
    pub schema_versions_published: u64,
    pub windows_refreshed: u64,
    pub late_rows_rejected: u64,
    pub inconsistencies: u64,
    pub records_checked: u64,
    pub anomalies: u64,
    pub runs_succeeded: u64,
    pub runs_partially_failed: u64,
    pub runs_failed: u64,
    start_time: Option<Instant>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Fold one event into the counters.
    pub fn record(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::FileCommitted {
                rows, error_rows, ..
            } => {
                self.files_committed += 1;
                self.rows_ingested += rows;
                self.row_errors += error_rows;
            }
            PipelineEvent::FileFailed { .. } => self.files_failed += 1,
            PipelineEvent::LedgerConflict { .. } => self.ledger_conflicts += 1,
            PipelineEvent::SchemaEvolved { .. } => self.schema_versions_published += 1,
            PipelineEvent::WindowRefreshed { .. } => self.windows_refreshed += 1,
            PipelineEvent::LatenessViolation { .. } => self.late_rows_rejected += 1,
            PipelineEvent::AggregationInconsistency { .. } => self.inconsistencies += 1,
            PipelineEvent::AnomalyRate {
                records, anomalies, ..
            } => {
                self.records_checked += records;
                self.anomalies += anomalies;
            }
            PipelineEvent::RunFinished { status, .. } => self.record_run(*status),
        }
    }

    /// Record a finished run.
    pub fn record_run(&mut self, status: RunStatus) {
        match status {
            RunStatus::Succeeded => self.runs_succeeded += 1,
            RunStatus::PartiallyFailed => self.runs_partially_failed += 1,
            RunStatus::Failed => self.runs_failed += 1,
            RunStatus::Running => {}
        }
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|s| s.elapsed().as_secs()).unwrap_or(0)
    }

    /// Anomalies per checked record, or zero before any check.
    pub fn anomaly_rate(&self) -> f64 {
        if self.records_checked == 0 {
            0.0
        } else {
            self.anomalies as f64 / self.records_checked as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_committed: self.files_committed,
            files_failed: self.files_failed,
            ledger_conflicts: self.ledger_conflicts,
            rows_ingested: self.rows_ingested,
            row_errors: self.row_errors,
            schema_versions_published: self.schema_versions_published,
            windows_refreshed: self.windows_refreshed,
            late_rows_rejected: self.late_rows_rejected,
            inconsistencies: self.inconsistencies,
            anomaly_rate: self.anomaly_rate(),
            runs_succeeded: self.runs_succeeded,
            runs_partially_failed: self.runs_partially_failed,
            runs_failed: self.runs_failed,
            uptime_secs: self.uptime_secs(),
        }
    }
}

/// Immutable snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub files_committed: u64,
    pub files_failed: u64,
    pub ledger_conflicts: u64,
    pub rows_ingested: u64,
    pub row_errors: u64,
    pub schema_versions_published: u64,
    pub windows_refreshed: u64,
    pub late_rows_rejected: u64,
    pub inconsistencies: u64,
    pub anomaly_rate: f64,
    pub runs_succeeded: u64,
    pub runs_partially_failed: u64,
    pub runs_failed: u64,
    pub uptime_secs: u64,
}

/// Event sink that keeps a [`PipelineMetrics`] up to date.
#[derive(Debug)]
pub struct MetricsSink {
    metrics: Mutex<PipelineMetrics>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self {
            metrics: Mutex::new(PipelineMetrics::new()),
        }
    }

    pub fn snapshot(&self) -> Option<MetricsSnapshot> {
        self.metrics.lock().ok().map(|m| m.snapshot())
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MetricsSink {
    fn emit(&self, event: &PipelineEvent) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.record(event);
        }
    }
}
