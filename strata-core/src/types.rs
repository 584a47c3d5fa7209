//! Record types shared by the bronze, silver and gold tiers, the file ledger
//! and pipeline runs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Flat field-name to value mapping carried by bronze and silver rows.
pub type Payload = Map<String, Value>;

// ---------------------------------------------------------------------------
// File ledger
// ---------------------------------------------------------------------------

/// Lifecycle of a source file in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Committed,
    Failed,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Pending => write!(f, "pending"),
            FileStatus::Committed => write!(f, "committed"),
            FileStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "committed" => Ok(FileStatus::Committed),
            "failed" => Ok(FileStatus::Failed),
            other => Err(format!("unknown file status: {other}")),
        }
    }
}

/// Durable ledger entry for one source file of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedFileRecord {
    pub dataset: String,
    pub file_identity: String,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    pub row_count: u64,
    pub error_rows: u64,
    pub ingested_at: DateTime<Utc>,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<Uuid>,
}

impl IngestedFileRecord {
    /// A fresh Pending claim for a file.
    pub fn pending(
        dataset: impl Into<String>,
        file_identity: impl Into<String>,
        fingerprint: impl Into<String>,
        run_id: Uuid,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            file_identity: file_identity.into(),
            fingerprint: fingerprint.into(),
            schema_version: None,
            row_count: 0,
            error_rows: 0,
            ingested_at: Utc::now(),
            status: FileStatus::Pending,
            failure_kind: None,
            failure_reason: None,
            claimed_by: Some(run_id),
        }
    }
}

/// A file identity that was observed with a different fingerprint than the
/// one already committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConflict {
    pub dataset: String,
    pub file_identity: String,
    pub committed_fingerprint: String,
    pub observed_fingerprint: String,
    pub detected_at: DateTime<Utc>,
    pub acknowledged: bool,
}

// ---------------------------------------------------------------------------
// Bronze
// ---------------------------------------------------------------------------

/// An append-only raw row. `seq` is assigned by the table store on write and
/// reflects arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub seq: i64,
    pub dataset: String,
    pub source_file: String,
    pub row_index: u64,
    pub schema_version: u32,
    pub ingested_at: DateTime<Utc>,
    pub payload: Payload,
}

// ---------------------------------------------------------------------------
// Silver
// ---------------------------------------------------------------------------

/// Validation outcome attached to a silver row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    OutOfRange,
    MissingRequired,
    DuplicateKey,
    SchemaDrift,
    OutOfOrder,
}

impl fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityFlag::OutOfRange => write!(f, "out_of_range"),
            QualityFlag::MissingRequired => write!(f, "missing_required"),
            QualityFlag::DuplicateKey => write!(f, "duplicate_key"),
            QualityFlag::SchemaDrift => write!(f, "schema_drift"),
            QualityFlag::OutOfOrder => write!(f, "out_of_order"),
        }
    }
}

/// An anomaly annotation produced by an anomaly policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    StatisticalOutlier {
        field: String,
        value: f64,
        score: f64,
        expected_low: f64,
        expected_high: f64,
    },
    ReadingGap {
        gap_secs: i64,
    },
}

/// Deduplication key of a silver row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub entity_key: String,
    pub event_time: DateTime<Utc>,
}

/// A validated, deduplicated row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    /// Silver sequence number, reassigned every time the key is rewritten.
    pub seq: i64,
    pub dataset: String,
    pub entity_key: String,
    pub event_time: DateTime<Utc>,
    pub fields: Payload,
    pub flags: BTreeSet<QualityFlag>,
    #[serde(default)]
    pub anomalies: Vec<Anomaly>,
    pub is_anomaly: bool,
    pub bronze_seq: i64,
    pub source_file: String,
    pub schema_version: u32,
    pub processed_at: DateTime<Utc>,
}

impl CleanRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            entity_key: self.entity_key.clone(),
            event_time: self.event_time,
        }
    }

    /// Numeric value of a field, if present and numeric.
    pub fn numeric(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(Value::as_f64)
    }

    pub fn has_flag(&self, flag: QualityFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// A bronze row that lost deduplication to a later-arriving row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supersession {
    pub dataset: String,
    pub bronze_seq: i64,
    pub superseded_by: i64,
    pub entity_key: String,
    pub event_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Gold
// ---------------------------------------------------------------------------

/// Aggregation window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub fn duration(self) -> Duration {
        match self {
            Granularity::Hour => Duration::hours(1),
            Granularity::Day => Duration::days(1),
        }
    }

    /// Start of the UTC window containing `t`.
    pub fn window_start(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let span = self.duration().num_milliseconds();
        let millis = t.timestamp_millis();
        DateTime::from_timestamp_millis(millis - millis.rem_euclid(span)).unwrap_or(t)
    }

    pub fn window_end(self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + self.duration()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hour" | "hourly" => Ok(Granularity::Hour),
            "day" | "daily" => Ok(Granularity::Day),
            other => Err(format!("unknown granularity: {other}")),
        }
    }
}

/// Summary statistics of one metric field within a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// One gold row per (entity, granularity, window start).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub dataset: String,
    pub entity_key: String,
    pub granularity: Granularity,
    pub window_start: DateTime<Utc>,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub source_record_count: u64,
    pub anomaly_count: u64,
    pub flagged_count: u64,
    pub input_digest: String,
    pub last_refreshed_at: DateTime<Utc>,
}

impl AggregateRow {
    /// SHA-256 over everything except the refresh timestamp.
    pub fn values_digest(&self) -> String {
        let canonical = serde_json::json!({
            "dataset": self.dataset,
            "entity_key": self.entity_key,
            "granularity": self.granularity,
            "window_start": self.window_start.timestamp_millis(),
            "metrics": self.metrics,
            "source_record_count": self.source_record_count,
            "anomaly_count": self.anomaly_count,
            "flagged_count": self.flagged_count,
            "input_digest": self.input_digest,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn same_values(&self, other: &AggregateRow) -> bool {
        self.values_digest() == other.values_digest()
    }
}

/// A silver row excluded from recomputation because it arrived beyond the
/// lateness horizon of an already-materialised window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateRejection {
    pub dataset: String,
    pub silver_seq: i64,
    pub entity_key: String,
    pub window_start: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
    pub rejected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Checkpoints & runs
// ---------------------------------------------------------------------------

/// Pipeline stage. Also names the per-stage checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingestion,
    Quality,
    Aggregation,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Ingestion => "ingestion",
            Stage::Quality => "quality",
            Stage::Aggregation => "aggregation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress marker of a stage for one dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last processed sequence number of the upstream tier.
    pub position: i64,
    /// Discovery: object modification time. Aggregation: event time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<DateTime<Utc>>,
}

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    PartiallyFailed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::PartiallyFailed => write!(f, "partially_failed"),
        }
    }
}

/// How a single stage invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    CompletedWithErrors,
    Failed,
    Cancelled,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub attempts: u32,
    pub records_processed: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Errors of one kind collected during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummaryItem {
    pub kind: ErrorKind,
    pub count: u64,
    pub examples: Vec<String>,
}

const MAX_SUMMARY_EXAMPLES: usize = 5;

/// One orchestrator invocation for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub dataset: String,
    /// Last stage entered.
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub records_processed: u64,
    pub error_summary: Vec<ErrorSummaryItem>,
    pub stages: Vec<StageReport>,
}

impl PipelineRun {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            dataset: dataset.into(),
            stage: Stage::Ingestion,
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Running,
            records_processed: 0,
            error_summary: Vec::new(),
            stages: Vec::new(),
        }
    }

    /// Add an error to the itemised summary, keeping a few examples per kind.
    pub fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.record_errors(kind, 1, Some(message.into()));
    }

    pub fn record_errors(&mut self, kind: ErrorKind, count: u64, example: Option<String>) {
        if count == 0 {
            return;
        }
        let idx = match self.error_summary.iter().position(|i| i.kind == kind) {
            Some(idx) => idx,
            None => {
                self.error_summary.push(ErrorSummaryItem {
                    kind,
                    count: 0,
                    examples: Vec::new(),
                });
                self.error_summary.len() - 1
            }
        };
        let item = &mut self.error_summary[idx];
        item.count += count;
        if let Some(example) = example {
            if item.examples.len() < MAX_SUMMARY_EXAMPLES {
                item.examples.push(example);
            }
        }
    }

    pub fn error_count(&self) -> u64 {
        self.error_summary.iter().map(|i| i.count).sum()
    }

    /// Close the run. A run that already left `Running` is not reopened.
    pub fn finish(&mut self, status: RunStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_start_truncates() {
        let t = Utc.with_ymd_and_hms(2024, 1, 3, 14, 37, 12).unwrap();
        assert_eq!(
            Granularity::Hour.window_start(t),
            Utc.with_ymd_and_hms(2024, 1, 3, 14, 0, 0).unwrap()
        );
        assert_eq!(
            Granularity::Day.window_start(t),
            Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_window_start_before_epoch() {
        let t = Utc.with_ymd_and_hms(1969, 12, 31, 23, 30, 0).unwrap();
        assert_eq!(
            Granularity::Hour.window_start(t),
            Utc.with_ymd_and_hms(1969, 12, 31, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_granularity_parse() {
        assert_eq!("hour".parse::<Granularity>().unwrap(), Granularity::Hour);
        assert_eq!("Daily".parse::<Granularity>().unwrap(), Granularity::Day);
        assert!("week".parse::<Granularity>().is_err());
    }

    #[test]
    fn test_run_error_summary_groups_by_kind() {
        let mut run = PipelineRun::new("sensors");
        run.record_error(ErrorKind::SchemaIncompatible, "a.csv");
        run.record_error(ErrorKind::SchemaIncompatible, "b.csv");
        run.record_errors(ErrorKind::PartialParseFailure, 7, None);
        assert_eq!(run.error_summary.len(), 2);
        assert_eq!(run.error_count(), 9);
        assert_eq!(run.error_summary[0].examples, vec!["a.csv", "b.csv"]);
    }

    #[test]
    fn test_run_finish_is_terminal_once() {
        let mut run = PipelineRun::new("sensors");
        run.finish(RunStatus::Failed);
        run.finish(RunStatus::Succeeded);
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn test_values_digest_ignores_refresh_time() {
        let row = AggregateRow {
            dataset: "sensors".into(),
            entity_key: "S1".into(),
            granularity: Granularity::Hour,
            window_start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            metrics: BTreeMap::new(),
            source_record_count: 3,
            anomaly_count: 0,
            flagged_count: 0,
            input_digest: "abc".into(),
            last_refreshed_at: Utc::now(),
        };
        let mut later = row.clone();
        later.last_refreshed_at = row.last_refreshed_at + Duration::minutes(5);
        assert!(row.same_values(&later));
        later.source_record_count = 4;
        assert!(!row.same_values(&later));
    }
}
