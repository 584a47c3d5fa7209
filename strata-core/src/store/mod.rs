//! Storage collaborators: the object store files land in and the durable
//! table store holding every pipeline tier, the ledger and checkpoints.

pub mod object;
pub mod sqlite;

pub use object::LocalObjectStore;
pub use sqlite::SqliteTableStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::aggregate::{WindowKey, WindowStatus};
use crate::error::StoreError;
use crate::schema::SchemaVersion;
use crate::types::{
    AggregateRow, Checkpoint, CleanRecord, FileStatus, Granularity, IngestedFileRecord,
    LateRejection, LedgerConflict, Payload, PipelineRun, RawRecord, RecordKey, Stage,
    Supersession,
};

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Object storage holding incoming source files.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Objects under `prefix` modified at or after `since`.
    async fn list_since(
        &self,
        prefix: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ObjectMeta>, StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Durable, atomic overwrite.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// One quality batch, written in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct SilverBatch {
    pub dataset: String,
    /// Upserted by dedup key. The store assigns a fresh silver `seq`.
    pub records: Vec<CleanRecord>,
    pub supersessions: Vec<Supersession>,
    /// New quality checkpoint (last bronze seq consumed).
    pub checkpoint: Checkpoint,
}

/// Durable table store.
///
/// Every method that changes more than one table does so atomically.
#[async_trait]
pub trait TableStore: Send + Sync {
    // -- schema log --------------------------------------------------------

    /// All published versions of a dataset, oldest first.
    async fn schema_versions(&self, dataset: &str) -> Result<Vec<SchemaVersion>, StoreError>;

    /// Compare-and-set publish: succeeds only if `version.version` is exactly
    /// one past the latest stored version.
    async fn publish_schema(&self, version: &SchemaVersion) -> Result<bool, StoreError>;

    // -- file ledger -------------------------------------------------------

    async fn ledger_entry(
        &self,
        dataset: &str,
        file_identity: &str,
    ) -> Result<Option<IngestedFileRecord>, StoreError>;

    /// Insert if absent. Returns false when an entry already exists.
    async fn ledger_insert(&self, entry: &IngestedFileRecord) -> Result<bool, StoreError>;

    /// Replace `expected` with `next` if the stored entry still has the
    /// expected status, fingerprint and claimant.
    async fn ledger_swap(
        &self,
        expected: &IngestedFileRecord,
        next: &IngestedFileRecord,
    ) -> Result<bool, StoreError>;

    async fn ledger_entries(
        &self,
        dataset: &str,
        status: Option<FileStatus>,
    ) -> Result<Vec<IngestedFileRecord>, StoreError>;

    /// Replace the bronze rows of `committed.file_identity` with `rows` and
    /// flip its ledger entry Pending to Committed, in one transaction.
    ///
    /// Returns false without writing anything unless the stored entry is
    /// Pending with the same fingerprint and claimant.
    async fn commit_file(
        &self,
        committed: &IngestedFileRecord,
        rows: &[Payload],
    ) -> Result<bool, StoreError>;

    /// Returns false when this exact conflict was already recorded.
    async fn record_conflict(&self, conflict: &LedgerConflict) -> Result<bool, StoreError>;

    async fn conflicts(
        &self,
        dataset: &str,
        include_acknowledged: bool,
    ) -> Result<Vec<LedgerConflict>, StoreError>;

    /// Acknowledge every open conflict of a file. Returns how many changed.
    async fn acknowledge_conflict(
        &self,
        dataset: &str,
        file_identity: &str,
    ) -> Result<usize, StoreError>;

    // -- bronze ------------------------------------------------------------

    async fn bronze_after(
        &self,
        dataset: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError>;

    async fn bronze_count(&self, dataset: &str) -> Result<u64, StoreError>;

    // -- checkpoints -------------------------------------------------------

    /// Stored checkpoint, or the zero checkpoint.
    async fn checkpoint(&self, dataset: &str, stage: Stage) -> Result<Checkpoint, StoreError>;

    async fn set_checkpoint(
        &self,
        dataset: &str,
        stage: Stage,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError>;

    // -- silver ------------------------------------------------------------

    /// Bronze seq of the current silver row for each key that exists.
    async fn silver_existing(
        &self,
        dataset: &str,
        keys: &[RecordKey],
    ) -> Result<HashMap<RecordKey, i64>, StoreError>;

    /// Most recent `limit` rows of an entity by event time, oldest first.
    async fn silver_recent(
        &self,
        dataset: &str,
        entity_key: &str,
        limit: usize,
    ) -> Result<Vec<CleanRecord>, StoreError>;

    /// Event time of the entity's last-arrived silver row.
    async fn silver_last_arrival(
        &self,
        dataset: &str,
        entity_key: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn commit_silver(&self, batch: &SilverBatch) -> Result<(), StoreError>;

    async fn silver_after(
        &self,
        dataset: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<CleanRecord>, StoreError>;

    /// Silver rows of one entity in `[start, end)`, ordered by event time,
    /// excluding late-rejected rows.
    async fn silver_window(
        &self,
        dataset: &str,
        entity_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CleanRecord>, StoreError>;

    async fn silver_record(
        &self,
        dataset: &str,
        key: &RecordKey,
    ) -> Result<Option<CleanRecord>, StoreError>;

    async fn silver_count(&self, dataset: &str) -> Result<u64, StoreError>;

    async fn supersessions(&self, dataset: &str) -> Result<Vec<Supersession>, StoreError>;

    // -- windows & gold ----------------------------------------------------

    /// Window states, optionally limited to windows starting in `[start, end)`.
    async fn windows(
        &self,
        dataset: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<WindowStatus>, StoreError>;

    /// `None` for a window never marked (implicitly Stale).
    async fn window_status(&self, key: &WindowKey) -> Result<Option<WindowStatus>, StoreError>;

    async fn set_window_state(&self, status: &WindowStatus) -> Result<(), StoreError>;

    /// Mark windows Dirty, record late rejections and advance the aggregation
    /// checkpoint together.
    async fn commit_window_marks(
        &self,
        dataset: &str,
        dirty: &[WindowKey],
        rejections: &[LateRejection],
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError>;

    /// Upsert a gold row and mark its window Fresh together.
    async fn commit_refresh(&self, row: &AggregateRow) -> Result<(), StoreError>;

    async fn gold_row(&self, key: &WindowKey) -> Result<Option<AggregateRow>, StoreError>;

    async fn gold_rows(
        &self,
        dataset: &str,
        entity_key: Option<&str>,
        granularity: Option<Granularity>,
    ) -> Result<Vec<AggregateRow>, StoreError>;

    async fn late_rejections(&self, dataset: &str) -> Result<Vec<LateRejection>, StoreError>;

    // -- runs --------------------------------------------------------------

    async fn save_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Most recent runs first.
    async fn runs(
        &self,
        dataset: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PipelineRun>, StoreError>;
}
