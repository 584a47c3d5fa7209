//! Error types for the Strata pipeline core.
//!
//! Uses `thiserror` for public API error types with structured variants per
//! component (schema registry, ledger, ingestion, quality, aggregation,
//! storage, configuration, orchestration). Every error also maps onto the
//! operator-facing [`ErrorKind`] taxonomy used in run summaries and retry
//! decisions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Top-level error type for the Strata core library.
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Quality error: {0}")]
    Quality(#[from] QualityError),

    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Operator-facing error taxonomy.
///
/// Row- and file-level kinds are recovered locally and counted; dataset-level
/// kinds (`SchemaIncompatible`, `LedgerConflict`) need manual attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaIncompatible,
    LedgerConflict,
    PartialParseFailure,
    TransientIo,
    LatenessViolation,
    AggregationInconsistency,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::SchemaIncompatible => write!(f, "schema_incompatible"),
            ErrorKind::LedgerConflict => write!(f, "ledger_conflict"),
            ErrorKind::PartialParseFailure => write!(f, "partial_parse_failure"),
            ErrorKind::TransientIo => write!(f, "transient_io"),
            ErrorKind::LatenessViolation => write!(f, "lateness_violation"),
            ErrorKind::AggregationInconsistency => write!(f, "aggregation_inconsistency"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "schema_incompatible" => Ok(ErrorKind::SchemaIncompatible),
            "ledger_conflict" => Ok(ErrorKind::LedgerConflict),
            "partial_parse_failure" => Ok(ErrorKind::PartialParseFailure),
            "transient_io" => Ok(ErrorKind::TransientIo),
            "lateness_violation" => Ok(ErrorKind::LatenessViolation),
            "aggregation_inconsistency" => Ok(ErrorKind::AggregationInconsistency),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "internal" => Ok(ErrorKind::Internal),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

/// Errors from the schema registry.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Dataset '{dataset}' rejected incompatible schema: {reason}")]
    Incompatible { dataset: String, reason: String },

    #[error("Schema publish for '{dataset}' lost {attempts} compare-and-set races")]
    PublishContention { dataset: String, attempts: usize },

    #[error("Schema log for '{dataset}' is not contiguous at version {version}")]
    BrokenLog { dataset: String, version: u32 },
}

/// Errors from the file ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(
        "File '{file}' in '{dataset}' was overwritten in place (committed {committed}, observed {observed})"
    )]
    Conflict {
        dataset: String,
        file: String,
        committed: String,
        observed: String,
    },

    #[error("Dataset '{dataset}' is blocked by {conflicts} unresolved ledger conflict(s)")]
    DatasetBlocked { dataset: String, conflicts: usize },

    #[error("Ledger entry for '{file}' in '{dataset}' kept changing while claiming it")]
    ClaimContention { dataset: String, file: String },

    #[error("Ledger entry for '{file}' in '{dataset}' is {status}, expected pending")]
    NotPending {
        dataset: String,
        file: String,
        status: String,
    },

    #[error("Ledger entry for '{file}' in '{dataset}' is {status}; only failed files can be retried")]
    NotFailed {
        dataset: String,
        file: String,
        status: String,
    },

    #[error("No ledger entry for '{file}' in '{dataset}'")]
    NotFound { dataset: String, file: String },
}

/// Errors from file discovery and parsing.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to parse '{file}': {message}")]
    Parse { file: String, message: String },

    #[error(
        "File '{file}' has {error_rows} bad rows out of {total_rows} ({rate:.3} > {threshold:.3})"
    )]
    RowErrorRate {
        file: String,
        error_rows: u64,
        total_rows: u64,
        rate: f64,
        threshold: f64,
    },

    #[error("Unsupported file format: {file}")]
    UnsupportedFormat { file: String },
}

/// Errors from the quality and transformation engine.
#[derive(Debug, thiserror::Error)]
pub enum QualityError {
    #[error("Anomaly policy '{policy}' failed: {message}")]
    Policy { policy: String, message: String },

    #[error("Silver checkpoint for '{dataset}' would move backwards ({current} -> {proposed})")]
    CheckpointRegression {
        dataset: String,
        current: i64,
        proposed: i64,
    },
}

/// Errors from the aggregation engine.
#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("Invalid window state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Window {window} diverged on refresh: {message}")]
    Inconsistency { window: String, message: String },

    #[error("Late data for window {window} is beyond the {horizon_hours}h lateness horizon")]
    LatenessViolation { window: String, horizon_hours: u64 },
}

/// Errors from the storage collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Object not found: {key}")]
    ObjectNotFound { key: String },

    #[error("Invalid object key: {key}")]
    InvalidKey { key: String },

    #[error("Corrupt stored value: {message}")]
    Corrupt { message: String },

    #[error("Store connection lock poisoned")]
    Poisoned,

    #[error("Store task failed: {message}")]
    Task { message: String },
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            StoreError::Task { .. } => true,
            _ => false,
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Duplicate dataset name: {name}")]
    DuplicateDataset { name: String },

    #[error("Unknown dataset: {name}")]
    UnknownDataset { name: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the pipeline orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Run cancelled during {stage}")]
    Cancelled { stage: String },

    #[error("Stage {stage} gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        stage: String,
        attempts: u32,
        last_error: String,
    },
}

impl StrataError {
    /// Map this error onto the operator-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StrataError::Schema(SchemaError::Incompatible { .. }) => ErrorKind::SchemaIncompatible,
            StrataError::Schema(_) => ErrorKind::Internal,
            StrataError::Ledger(LedgerError::Conflict { .. })
            | StrataError::Ledger(LedgerError::DatasetBlocked { .. }) => ErrorKind::LedgerConflict,
            StrataError::Ledger(_) => ErrorKind::Internal,
            StrataError::Ingest(IngestError::RowErrorRate { .. })
            | StrataError::Ingest(IngestError::Parse { .. }) => ErrorKind::PartialParseFailure,
            StrataError::Ingest(IngestError::UnsupportedFormat { .. }) => ErrorKind::Internal,
            StrataError::Quality(_) => ErrorKind::Internal,
            StrataError::Aggregation(AggregationError::Inconsistency { .. }) => {
                ErrorKind::AggregationInconsistency
            }
            StrataError::Aggregation(AggregationError::LatenessViolation { .. }) => {
                ErrorKind::LatenessViolation
            }
            StrataError::Aggregation(_) => ErrorKind::Internal,
            StrataError::Store(e) if e.is_transient() => ErrorKind::TransientIo,
            StrataError::Store(_) => ErrorKind::Internal,
            StrataError::Io(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::WouldBlock
                ) =>
            {
                ErrorKind::TransientIo
            }
            StrataError::Io(_) => ErrorKind::Internal,
            StrataError::Pipeline(PipelineError::Cancelled { .. }) => ErrorKind::Cancelled,
            StrataError::Pipeline(PipelineError::RetriesExhausted { .. }) => ErrorKind::TransientIo,
            StrataError::Config(_) | StrataError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Whether the orchestrator should retry the stage that produced this error.
    pub fn is_transient(&self) -> bool {
        match self {
            StrataError::Pipeline(PipelineError::RetriesExhausted { .. }) => false,
            other => other.kind() == ErrorKind::TransientIo,
        }
    }
}

/// A type alias for results using the top-level `StrataError`.
pub type Result<T> = std::result::Result<T, StrataError>;
