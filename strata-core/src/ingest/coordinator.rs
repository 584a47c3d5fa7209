//! File discovery and bronze ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::parse::parse_file;
use crate::config::DatasetConfig;
use crate::error::{ErrorKind, IngestError, PipelineError, Result, StoreError, StrataError};
use crate::events::{EventSink, PipelineEvent};
use crate::ledger::{CommitOutcome, FileLedger, LedgerDecision};
use crate::schema::{SchemaDecision, SchemaRegistry, infer_fields};
use crate::store::{ObjectMeta, ObjectStore, TableStore};
use crate::types::{Checkpoint, FileStatus, IngestedFileRecord, Stage};

/// A file that did not reach bronze.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFailure {
    pub file: String,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Summary of one ingestion pass over a dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionReport {
    pub dataset: String,
    pub discovered: u64,
    pub committed: u64,
    /// Already committed with the same content.
    pub skipped: u64,
    /// Failed in an earlier run with the same content; awaiting an operator.
    pub previously_failed: Vec<FileFailure>,
    pub failed: Vec<FileFailure>,
    /// File identities observed with new content after being committed.
    pub conflicts: Vec<String>,
    /// Files left untouched because the pass was cancelled or blocked.
    pub not_started: u64,
    pub rows_written: u64,
    pub row_errors: u64,
    pub schema_versions_published: Vec<u32>,
    pub watermark: Option<DateTime<Utc>>,
}

impl IngestionReport {
    /// Whether any file needs operator attention.
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty() || !self.previously_failed.is_empty()
    }
}

/// What happened to one discovered file.
#[derive(Debug, Clone, PartialEq)]
enum FileOutcome {
    Committed {
        rows: u64,
        error_rows: u64,
        published: Option<u32>,
    },
    AlreadyCommitted,
    PreviouslyFailed(FileFailure),
    Failed(FileFailure),
    Conflict,
    NotStarted,
}

impl FileOutcome {
    /// Terminal outcomes let the discovery watermark move past the file.
    fn is_terminal(&self) -> bool {
        !matches!(self, FileOutcome::NotStarted)
    }
}

/// SHA-256 of file content, lowercase hex.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Discovers new files, parses them and commits them to bronze.
#[derive(Clone)]
pub struct IngestionCoordinator {
    objects: Arc<dyn ObjectStore>,
    store: Arc<dyn TableStore>,
    registry: Arc<SchemaRegistry>,
    ledger: FileLedger,
    events: Arc<dyn EventSink>,
    workers: usize,
}

impl IngestionCoordinator {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        store: Arc<dyn TableStore>,
        registry: Arc<SchemaRegistry>,
        events: Arc<dyn EventSink>,
        workers: usize,
    ) -> Self {
        Self {
            objects,
            ledger: FileLedger::new(Arc::clone(&store)),
            store,
            registry,
            events,
            workers: workers.max(1),
        }
    }

    pub fn ledger(&self) -> &FileLedger {
        &self.ledger
    }

    /// Ingest every new file of `dataset` on behalf of `run_id`.
    ///
    /// Fails up front when the dataset is blocked by a ledger conflict. A
    /// conflict found during the pass stops new files from starting.
    pub async fn run(
        &self,
        dataset: &DatasetConfig,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<IngestionReport> {
        self.ledger.ensure_unblocked(&dataset.name).await?;

        let checkpoint = self.store.checkpoint(&dataset.name, Stage::Ingestion).await?;
        let mut candidates: Vec<ObjectMeta> = self
            .objects
            .list_since(&dataset.source_prefix, checkpoint.watermark)
            .await?
            .into_iter()
            .filter(|o| dataset.format_of(&o.key).is_some())
            .collect();
        let requeued = self.requeued(dataset, &candidates).await?;
        if !requeued.is_empty() {
            debug!(dataset = %dataset.name, files = requeued.len(), "Re-listing queued files");
            candidates.extend(requeued);
            candidates.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.key.cmp(&b.key)));
        }

        let mut report = IngestionReport {
            dataset: dataset.name.clone(),
            discovered: candidates.len() as u64,
            watermark: checkpoint.watermark,
            ..Default::default()
        };
        debug!(
            dataset = %dataset.name,
            discovered = candidates.len(),
            since = ?checkpoint.watermark,
            "Discovered candidate files"
        );

        let dataset = Arc::new(dataset.clone());
        let stop = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(candidates.len());
        for meta in &candidates {
            let this = self.clone();
            let dataset = Arc::clone(&dataset);
            let stop = stop.clone();
            let sem = Arc::clone(&semaphore);
            let meta = meta.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return Ok(FileOutcome::NotStarted);
                };
                if stop.is_cancelled() {
                    return Ok(FileOutcome::NotStarted);
                }
                let outcome = this.ingest_file(&dataset, &meta, run_id).await;
                if matches!(outcome, Ok(FileOutcome::Conflict)) {
                    stop.cancel();
                }
                outcome
            }));
        }

        let mut first_error: Option<StrataError> = None;
        let mut terminal_prefix = true;
        for (meta, handle) in candidates.iter().zip(handles) {
            let outcome = match handle.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!(dataset = %dataset.name, file = %meta.key, error = %e, "File ingestion errored");
                    first_error.get_or_insert(e);
                    FileOutcome::NotStarted
                }
                Err(e) => {
                    first_error.get_or_insert(
                        StoreError::Task {
                            message: e.to_string(),
                        }
                        .into(),
                    );
                    FileOutcome::NotStarted
                }
            };
            terminal_prefix &= outcome.is_terminal();
            if terminal_prefix {
                report.watermark = report.watermark.max(Some(meta.modified));
            }
            match outcome {
                FileOutcome::Committed {
                    rows,
                    error_rows,
                    published,
                } => {
                    report.committed += 1;
                    report.rows_written += rows;
                    report.row_errors += error_rows;
                    report.schema_versions_published.extend(published);
                }
                FileOutcome::AlreadyCommitted => report.skipped += 1,
                FileOutcome::PreviouslyFailed(f) => report.previously_failed.push(f),
                FileOutcome::Failed(f) => report.failed.push(f),
                FileOutcome::Conflict => report.conflicts.push(meta.key.clone()),
                FileOutcome::NotStarted => report.not_started += 1,
            }
        }
        report.schema_versions_published.sort_unstable();

        if report.watermark != checkpoint.watermark {
            self.store
                .set_checkpoint(
                    &dataset.name,
                    Stage::Ingestion,
                    &Checkpoint {
                        position: checkpoint.position + report.committed as i64,
                        watermark: report.watermark,
                    },
                )
                .await?;
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if cancel.is_cancelled() && report.not_started > 0 {
            return Err(PipelineError::Cancelled {
                stage: Stage::Ingestion.to_string(),
            }
            .into());
        }

        info!(
            dataset = %dataset.name,
            discovered = report.discovered,
            committed = report.committed,
            skipped = report.skipped,
            failed = report.failed.len(),
            previously_failed = report.previously_failed.len(),
            conflicts = report.conflicts.len(),
            rows = report.rows_written,
            "Ingestion pass complete"
        );
        Ok(report)
    }

    /// Pending files behind the watermark: queued by `retry` or left by a
    /// crashed claim. They are listed again whatever their modification time.
    async fn requeued(
        &self,
        dataset: &DatasetConfig,
        listed: &[ObjectMeta],
    ) -> Result<Vec<ObjectMeta>> {
        let listed: HashSet<&str> = listed.iter().map(|o| o.key.as_str()).collect();
        let pending: HashSet<String> = self
            .ledger
            .entries(&dataset.name, Some(FileStatus::Pending))
            .await?
            .into_iter()
            .map(|e| e.file_identity)
            .filter(|key| !listed.contains(key.as_str()))
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .objects
            .list_since(&dataset.source_prefix, None)
            .await?
            .into_iter()
            .filter(|o| pending.contains(&o.key) && dataset.format_of(&o.key).is_some())
            .collect())
    }

    async fn ingest_file(
        &self,
        dataset: &DatasetConfig,
        meta: &ObjectMeta,
        run_id: Uuid,
    ) -> Result<FileOutcome> {
        let name = dataset.name.as_str();
        let bytes = self.objects.get(&meta.key).await?;
        let fp = fingerprint(&bytes);

        let claim = match self
            .ledger
            .try_begin_ingestion(name, &meta.key, &fp, run_id)
            .await?
        {
            LedgerDecision::Proceed(claim) => claim,
            LedgerDecision::AlreadyCommitted => {
                debug!(dataset = name, file = %meta.key, "Already committed, skipping");
                return Ok(FileOutcome::AlreadyCommitted);
            }
            LedgerDecision::ConflictingFingerprint(conflict) => {
                self.events.emit(&PipelineEvent::LedgerConflict {
                    dataset: name.to_string(),
                    file: meta.key.clone(),
                    committed_fingerprint: conflict.committed_fingerprint,
                    observed_fingerprint: conflict.observed_fingerprint,
                });
                return Ok(FileOutcome::Conflict);
            }
            LedgerDecision::PreviouslyFailed { kind, reason } => {
                return Ok(FileOutcome::PreviouslyFailed(FileFailure {
                    file: meta.key.clone(),
                    kind: kind.unwrap_or(ErrorKind::Internal),
                    reason: reason.unwrap_or_default(),
                }));
            }
        };

        let Some(format) = dataset.format_of(&meta.key) else {
            let reason = IngestError::UnsupportedFormat {
                file: meta.key.clone(),
            }
            .to_string();
            return self.fail(&claim, ErrorKind::Internal, reason).await;
        };

        let parsed = match parse_file(&meta.key, &bytes, format, dataset.csv_delimiter) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(&claim, ErrorKind::PartialParseFailure, e.to_string()).await,
        };
        let rate = parsed.error_rate();
        if rate > dataset.max_row_error_rate {
            let reason = IngestError::RowErrorRate {
                file: meta.key.clone(),
                error_rows: parsed.error_rows,
                total_rows: parsed.total_rows(),
                rate,
                threshold: dataset.max_row_error_rate,
            }
            .to_string();
            return self.fail(&claim, ErrorKind::PartialParseFailure, reason).await;
        }

        let observed = infer_fields(&parsed.columns, &parsed.rows);
        let (version, published) = match self.registry.propose_schema(name, &observed).await? {
            SchemaDecision::Accepted(version) => (version.version, None),
            SchemaDecision::EvolutionRequired { version, diff } => {
                self.events.emit(&PipelineEvent::SchemaEvolved {
                    dataset: name.to_string(),
                    version: version.version,
                    changes: diff,
                });
                (version.version, Some(version.version))
            }
            SchemaDecision::Incompatible { reason } => {
                return self.fail(&claim, ErrorKind::SchemaIncompatible, reason).await;
            }
        };

        match self
            .ledger
            .commit(&claim, version, &parsed.rows, parsed.error_rows)
            .await?
        {
            CommitOutcome::Committed => {
                self.events.emit(&PipelineEvent::FileCommitted {
                    dataset: name.to_string(),
                    file: meta.key.clone(),
                    rows: parsed.rows.len() as u64,
                    error_rows: parsed.error_rows,
                    schema_version: version,
                });
                Ok(FileOutcome::Committed {
                    rows: parsed.rows.len() as u64,
                    error_rows: parsed.error_rows,
                    published,
                })
            }
            CommitOutcome::AlreadyCommitted => Ok(FileOutcome::AlreadyCommitted),
        }
    }

    async fn fail(
        &self,
        claim: &IngestedFileRecord,
        kind: ErrorKind,
        reason: String,
    ) -> Result<FileOutcome> {
        self.ledger.mark_failed(claim, kind, reason.clone()).await?;
        self.events.emit(&PipelineEvent::FileFailed {
            dataset: claim.dataset.clone(),
            file: claim.file_identity.clone(),
            kind,
            reason: reason.clone(),
        });
        Ok(FileOutcome::Failed(FileFailure {
            file: claim.file_identity.clone(),
            kind,
            reason,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::store::{LocalObjectStore, SqliteTableStore};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        objects: Arc<LocalObjectStore>,
        store: Arc<dyn TableStore>,
        events: Arc<MemoryEventSink>,
        coordinator: IngestionCoordinator,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let objects = Arc::new(LocalObjectStore::new(dir.path()));
        let store: Arc<dyn TableStore> = Arc::new(SqliteTableStore::open_in_memory().unwrap());
        let registry = Arc::new(SchemaRegistry::new(Arc::clone(&store)));
        let events = Arc::new(MemoryEventSink::new());
        let coordinator = IngestionCoordinator::new(
            objects.clone(),
            Arc::clone(&store),
            registry,
            events.clone(),
            2,
        );
        Harness {
            _dir: dir,
            objects,
            store,
            events,
            coordinator,
        }
    }

    fn dataset() -> DatasetConfig {
        DatasetConfig::new("sensors", "raw/")
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let a = fingerprint(b"abc");
        assert_eq!(a.len(), 64);
        assert_eq!(
            a,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_ingests_and_skips_on_rerun() {
        let h = harness();
        h.objects
            .put("raw/a.csv", b"sensor_id,timestamp,temperature\nS1,2024-01-01 00:00:00,20.5\n")
            .await
            .unwrap();
        h.objects.put("raw/readme.txt", b"ignore me").await.unwrap();
        let cancel = CancellationToken::new();

        let report = h.coordinator.run(&dataset(), Uuid::new_v4(), &cancel).await.unwrap();
        assert_eq!(report.discovered, 1);
        assert_eq!(report.committed, 1);
        assert_eq!(report.rows_written, 1);
        assert_eq!(report.schema_versions_published, vec![1]);
        assert!(report.watermark.is_some());
        assert_eq!(h.events.named("file_committed").len(), 1);
        assert_eq!(h.events.named("schema_evolved").len(), 1);

        let again = h.coordinator.run(&dataset(), Uuid::new_v4(), &cancel).await.unwrap();
        assert_eq!(again.committed, 0);
        assert_eq!(again.skipped, 1);
        assert_eq!(h.store.bronze_count("sensors").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incompatible_file_fails_alone() {
        let h = harness();
        h.objects
            .put("raw/1.csv", b"sensor_id,temperature\nS1,20.5\n")
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        h.coordinator.run(&dataset(), Uuid::new_v4(), &cancel).await.unwrap();

        h.objects
            .put("raw/2.csv", b"sensor_id,temperature\nS1,20.5\n")
            .await
            .unwrap();
        h.objects
            .put("raw/3.csv", b"sensor_id,temperature\nS1,hot\n")
            .await
            .unwrap();
        let report = h.coordinator.run(&dataset(), Uuid::new_v4(), &cancel).await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].kind, ErrorKind::SchemaIncompatible);
        let entry = h.store.ledger_entry("sensors", "raw/3.csv").await.unwrap().unwrap();
        assert_eq!(entry.status, FileStatus::Failed);
        assert_eq!(h.store.bronze_count("sensors").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_row_error_threshold() {
        let h = harness();
        let mut ds = dataset();
        ds.max_row_error_rate = 0.25;
        h.objects
            .put("raw/ok.csv", b"a,b\n1,2\n3,4\n5,6\n7\n")
            .await
            .unwrap();
        h.objects
            .put("raw/bad.csv", b"a,b\n1,2\n3\n5\n")
            .await
            .unwrap();
        let report = h
            .coordinator
            .run(&ds, Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.row_errors, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].file, "raw/bad.csv");
        assert_eq!(report.failed[0].kind, ErrorKind::PartialParseFailure);
        assert_eq!(h.store.bronze_count("sensors").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retried_file_behind_watermark_is_relisted() {
        let h = harness();
        let mut ds = dataset();
        ds.max_row_error_rate = 0.25;
        let cancel = CancellationToken::new();
        h.objects
            .put("raw/bad.csv", b"a,b\n1,2\n3,4\n5\n")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        h.objects.put("raw/ok.csv", b"a,b\n7,8\n").await.unwrap();

        let report = h.coordinator.run(&ds, Uuid::new_v4(), &cancel).await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.failed.len(), 1);
        let watermark = report.watermark;

        h.coordinator.ledger().retry("sensors", "raw/bad.csv").await.unwrap();
        ds.max_row_error_rate = 0.5;
        let report = h.coordinator.run(&ds, Uuid::new_v4(), &cancel).await.unwrap();
        assert_eq!(report.committed, 1);
        assert!(report.failed.is_empty());
        assert_eq!(report.watermark, watermark);
        let entry = h.store.ledger_entry("sensors", "raw/bad.csv").await.unwrap().unwrap();
        assert_eq!(entry.status, FileStatus::Committed);
        assert_eq!(entry.row_count, 2);
        assert_eq!(h.store.bronze_count("sensors").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_conflict_blocks_next_run() {
        let h = harness();
        let cancel = CancellationToken::new();
        h.objects.put("raw/a.csv", b"a\n1\n").await.unwrap();
        h.coordinator.run(&dataset(), Uuid::new_v4(), &cancel).await.unwrap();

        h.objects.put("raw/a.csv", b"a\n2\n").await.unwrap();
        let report = h.coordinator.run(&dataset(), Uuid::new_v4(), &cancel).await.unwrap();
        assert_eq!(report.conflicts, vec!["raw/a.csv".to_string()]);
        assert_eq!(h.events.named("ledger_conflict").len(), 1);

        let err = h
            .coordinator
            .run(&dataset(), Uuid::new_v4(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LedgerConflict);
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_files_for_later() {
        let h = harness();
        h.objects.put("raw/a.csv", b"a\n1\n").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h
            .coordinator
            .run(&dataset(), Uuid::new_v4(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(
            h.store
                .checkpoint("sensors", Stage::Ingestion)
                .await
                .unwrap()
                .watermark,
            None
        );

        let report = h
            .coordinator
            .run(&dataset(), Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.committed, 1);
    }
}
