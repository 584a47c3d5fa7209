//! # Strata Core
//!
//! Core library for the Strata ingestion pipeline.
//! Provides the schema registry, file ledger, ingestion coordinator, quality
//! engine, incremental aggregation, pipeline orchestrator, storage
//! collaborators, configuration and fundamental types.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod quality;
pub mod sample;
pub mod schema;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use aggregate::{AggregationEngine, AggregationReport, WindowKey, WindowState, WindowStatus};
pub use config::{DatasetConfig, FileFormat, PipelineConfig, load_config};
pub use error::{ErrorKind, Result, StrataError};
pub use events::{
    EventSink, FanoutSink, JsonlEventSink, MemoryEventSink, PipelineEvent, TracingEventSink,
};
pub use ingest::{IngestionCoordinator, IngestionReport};
pub use ledger::{CommitOutcome, FileLedger, LedgerDecision};
pub use metrics::{MetricsSink, MetricsSnapshot, PipelineMetrics};
pub use orchestrator::{DatasetStatus, Pipeline, RetryPolicy};
pub use quality::{AnomalyPolicy, QualityEngine, QualityReport};
pub use sample::{SampleGenerator, SampleOptions, SampleSummary};
pub use schema::{SchemaDecision, SchemaRegistry, SchemaVersion};
pub use store::{LocalObjectStore, ObjectStore, SqliteTableStore, TableStore};
pub use types::{
    AggregateRow, CleanRecord, FileStatus, Granularity, IngestedFileRecord, PipelineRun,
    QualityFlag, RawRecord, RunStatus, Stage,
};
