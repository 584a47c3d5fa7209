//! File ledger: exactly-once ingestion per `(dataset, file_identity)`.
//!
//! Claims are taken with compare-and-set operations on the table store, so
//! concurrent workers and restarted processes agree on who ingests a file.
//! A commit replaces the file's bronze rows and flips the entry to Committed
//! in one transaction.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, LedgerError, Result};
use crate::store::TableStore;
use crate::types::{FileStatus, IngestedFileRecord, LedgerConflict, Payload};

/// How many times a claim is retried when the entry changes underneath it.
const MAX_CLAIM_ATTEMPTS: usize = 5;

/// Outcome of [`FileLedger::try_begin_ingestion`].
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerDecision {
    /// The caller holds this Pending claim and must commit or fail it.
    Proceed(IngestedFileRecord),
    AlreadyCommitted,
    /// Same identity, new content. Recorded and never overwritten.
    ConflictingFingerprint(LedgerConflict),
    /// The same content already failed; waiting for an operator.
    PreviouslyFailed {
        kind: Option<ErrorKind>,
        reason: Option<String>,
    },
}

/// Result of committing a claimed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed,
    /// Someone committed the same content first; nothing was written.
    AlreadyCommitted,
}

/// Next step of the claim protocol for one observed file.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    Insert(IngestedFileRecord),
    Swap {
        expected: IngestedFileRecord,
        next: IngestedFileRecord,
    },
    Decided(LedgerDecision),
}

/// Decide what to do with a file given its current ledger entry.
///
/// `acknowledged` lists fingerprints an operator accepted as overwrites of
/// this identity; they count as already committed.
fn decide(
    dataset: &str,
    file_identity: &str,
    fingerprint: &str,
    run_id: Uuid,
    existing: Option<&IngestedFileRecord>,
    acknowledged: &[String],
) -> Step {
    let claim = || IngestedFileRecord::pending(dataset, file_identity, fingerprint, run_id);
    let Some(entry) = existing else {
        return Step::Insert(claim());
    };
    match entry.status {
        // Left behind by a crashed or concurrent run; take it over.
        FileStatus::Pending => Step::Swap {
            expected: entry.clone(),
            next: claim(),
        },
        FileStatus::Committed if entry.fingerprint == fingerprint => {
            Step::Decided(LedgerDecision::AlreadyCommitted)
        }
        FileStatus::Committed if acknowledged.iter().any(|fp| fp == fingerprint) => {
            Step::Decided(LedgerDecision::AlreadyCommitted)
        }
        FileStatus::Committed => Step::Decided(LedgerDecision::ConflictingFingerprint(
            LedgerConflict {
                dataset: dataset.to_string(),
                file_identity: file_identity.to_string(),
                committed_fingerprint: entry.fingerprint.clone(),
                observed_fingerprint: fingerprint.to_string(),
                detected_at: Utc::now(),
                acknowledged: false,
            },
        )),
        FileStatus::Failed if entry.fingerprint == fingerprint => {
            Step::Decided(LedgerDecision::PreviouslyFailed {
                kind: entry.failure_kind,
                reason: entry.failure_reason.clone(),
            })
        }
        // Fixed and re-uploaded.
        FileStatus::Failed => Step::Swap {
            expected: entry.clone(),
            next: claim(),
        },
    }
}

/// Durable record of which source files were ingested.
#[derive(Clone)]
pub struct FileLedger {
    store: Arc<dyn TableStore>,
}

impl FileLedger {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    /// Claim a file for ingestion by `run_id`, or explain why not.
    pub async fn try_begin_ingestion(
        &self,
        dataset: &str,
        file_identity: &str,
        fingerprint: &str,
        run_id: Uuid,
    ) -> Result<LedgerDecision> {
        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let existing = self.store.ledger_entry(dataset, file_identity).await?;
            let acknowledged = match &existing {
                Some(e) if e.status == FileStatus::Committed && e.fingerprint != fingerprint => {
                    self.acknowledged_fingerprints(dataset, file_identity).await?
                }
                _ => Vec::new(),
            };

            match decide(
                dataset,
                file_identity,
                fingerprint,
                run_id,
                existing.as_ref(),
                &acknowledged,
            ) {
                Step::Insert(claim) => {
                    if self.store.ledger_insert(&claim).await? {
                        debug!(dataset, file = file_identity, "Claimed new file");
                        return Ok(LedgerDecision::Proceed(claim));
                    }
                }
                Step::Swap { expected, next } => {
                    if self.store.ledger_swap(&expected, &next).await? {
                        debug!(
                            dataset,
                            file = file_identity,
                            previous = %expected.status,
                            "Re-claimed file"
                        );
                        return Ok(LedgerDecision::Proceed(next));
                    }
                }
                Step::Decided(LedgerDecision::ConflictingFingerprint(conflict)) => {
                    if self.store.record_conflict(&conflict).await? {
                        warn!(
                            dataset,
                            file = file_identity,
                            committed = %conflict.committed_fingerprint,
                            observed = %conflict.observed_fingerprint,
                            "Recorded ledger conflict"
                        );
                    }
                    return Ok(LedgerDecision::ConflictingFingerprint(conflict));
                }
                Step::Decided(decision) => return Ok(decision),
            }
            debug!(dataset, file = file_identity, attempt, "Ledger entry changed, retrying claim");
        }

        Err(LedgerError::ClaimContention {
            dataset: dataset.to_string(),
            file: file_identity.to_string(),
        }
        .into())
    }

    async fn acknowledged_fingerprints(
        &self,
        dataset: &str,
        file_identity: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .store
            .conflicts(dataset, true)
            .await?
            .into_iter()
            .filter(|c| c.acknowledged && c.file_identity == file_identity)
            .map(|c| c.observed_fingerprint)
            .collect())
    }

    /// Write `rows` to bronze and mark the claim Committed, atomically.
    pub async fn commit(
        &self,
        claim: &IngestedFileRecord,
        schema_version: u32,
        rows: &[Payload],
        error_rows: u64,
    ) -> Result<CommitOutcome> {
        let committed = IngestedFileRecord {
            schema_version: Some(schema_version),
            row_count: rows.len() as u64,
            error_rows,
            ingested_at: Utc::now(),
            status: FileStatus::Committed,
            ..claim.clone()
        };
        if self.store.commit_file(&committed, rows).await? {
            info!(
                dataset = %claim.dataset,
                file = %claim.file_identity,
                rows = rows.len(),
                schema_version,
                "Committed file"
            );
            return Ok(CommitOutcome::Committed);
        }
        match self.lost_claim(claim).await? {
            Some(outcome) => Ok(outcome),
            None => Ok(CommitOutcome::AlreadyCommitted),
        }
    }

    /// Finalise a claim as Failed. No bronze rows are written.
    pub async fn mark_failed(
        &self,
        claim: &IngestedFileRecord,
        kind: ErrorKind,
        reason: impl Into<String>,
    ) -> Result<()> {
        let reason = reason.into();
        let failed = IngestedFileRecord {
            ingested_at: Utc::now(),
            status: FileStatus::Failed,
            failure_kind: Some(kind),
            failure_reason: Some(reason.clone()),
            ..claim.clone()
        };
        if self.store.ledger_swap(claim, &failed).await? {
            warn!(
                dataset = %claim.dataset,
                file = %claim.file_identity,
                kind = %kind,
                reason = %reason,
                "Marked file failed"
            );
            return Ok(());
        }
        self.lost_claim(claim).await.map(|_| ())
    }

    /// Explain why a claim could not be finalised. A matching Committed entry
    /// is reported as already committed; anything else is an error.
    async fn lost_claim(&self, claim: &IngestedFileRecord) -> Result<Option<CommitOutcome>> {
        let current = self
            .store
            .ledger_entry(&claim.dataset, &claim.file_identity)
            .await?;
        match current {
            Some(c) if c.status == FileStatus::Committed && c.fingerprint == claim.fingerprint => {
                debug!(
                    dataset = %claim.dataset,
                    file = %claim.file_identity,
                    "File already committed by another run"
                );
                Ok(Some(CommitOutcome::AlreadyCommitted))
            }
            Some(c) if c.status == FileStatus::Pending => Err(LedgerError::ClaimContention {
                dataset: claim.dataset.clone(),
                file: claim.file_identity.clone(),
            }
            .into()),
            Some(c) => Err(LedgerError::NotPending {
                dataset: claim.dataset.clone(),
                file: claim.file_identity.clone(),
                status: c.status.to_string(),
            }
            .into()),
            None => Err(LedgerError::NotFound {
                dataset: claim.dataset.clone(),
                file: claim.file_identity.clone(),
            }
            .into()),
        }
    }

    /// Put a Failed file back to Pending. The coordinator re-lists Pending
    /// entries regardless of the discovery watermark, so the next run ingests
    /// the file again and the entry stays visible until it settles.
    pub async fn retry(&self, dataset: &str, file_identity: &str) -> Result<()> {
        let Some(entry) = self.store.ledger_entry(dataset, file_identity).await? else {
            return Err(LedgerError::NotFound {
                dataset: dataset.to_string(),
                file: file_identity.to_string(),
            }
            .into());
        };
        if entry.status != FileStatus::Failed {
            return Err(LedgerError::NotFailed {
                dataset: dataset.to_string(),
                file: file_identity.to_string(),
                status: entry.status.to_string(),
            }
            .into());
        }
        let queued = IngestedFileRecord {
            status: FileStatus::Pending,
            row_count: 0,
            error_rows: 0,
            ingested_at: Utc::now(),
            failure_kind: None,
            failure_reason: None,
            claimed_by: None,
            ..entry.clone()
        };
        if !self.store.ledger_swap(&entry, &queued).await? {
            return Err(LedgerError::ClaimContention {
                dataset: dataset.to_string(),
                file: file_identity.to_string(),
            }
            .into());
        }
        info!(dataset, file = file_identity, "Failed file queued for retry");
        Ok(())
    }

    pub async fn entry(
        &self,
        dataset: &str,
        file_identity: &str,
    ) -> Result<Option<IngestedFileRecord>> {
        Ok(self.store.ledger_entry(dataset, file_identity).await?)
    }

    pub async fn entries(
        &self,
        dataset: &str,
        status: Option<FileStatus>,
    ) -> Result<Vec<IngestedFileRecord>> {
        Ok(self.store.ledger_entries(dataset, status).await?)
    }

    pub async fn conflicts(
        &self,
        dataset: &str,
        include_acknowledged: bool,
    ) -> Result<Vec<LedgerConflict>> {
        Ok(self.store.conflicts(dataset, include_acknowledged).await?)
    }

    /// Fails with `DatasetBlocked` while unacknowledged conflicts exist.
    pub async fn ensure_unblocked(&self, dataset: &str) -> Result<()> {
        let open = self.store.conflicts(dataset, false).await?;
        if open.is_empty() {
            Ok(())
        } else {
            Err(LedgerError::DatasetBlocked {
                dataset: dataset.to_string(),
                conflicts: open.len(),
            }
            .into())
        }
    }

    /// Acknowledge the open conflicts of a file, keeping the committed data.
    pub async fn acknowledge(&self, dataset: &str, file_identity: &str) -> Result<usize> {
        let changed = self
            .store
            .acknowledge_conflict(dataset, file_identity)
            .await?;
        if changed == 0 {
            return Err(LedgerError::NotFound {
                dataset: dataset.to_string(),
                file: file_identity.to_string(),
            }
            .into());
        }
        info!(dataset, file = file_identity, changed, "Acknowledged ledger conflict");
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrataError;
    use crate::store::SqliteTableStore;
    use serde_json::json;

    fn ledger() -> (FileLedger, Arc<dyn TableStore>) {
        let store: Arc<dyn TableStore> = Arc::new(SqliteTableStore::open_in_memory().unwrap());
        (FileLedger::new(Arc::clone(&store)), store)
    }

    fn rows(n: usize) -> Vec<Payload> {
        (0..n)
            .map(|i| match json!({ "sensor_id": "S1", "value": i }) {
                serde_json::Value::Object(map) => map,
                _ => unreachable!(),
            })
            .collect()
    }

    fn entry(status: FileStatus, fingerprint: &str) -> IngestedFileRecord {
        IngestedFileRecord {
            status,
            ..IngestedFileRecord::pending("ds", "a.csv", fingerprint, Uuid::new_v4())
        }
    }

    #[test]
    fn test_decide_new_file_inserts() {
        let step = decide("ds", "a.csv", "fp1", Uuid::new_v4(), None, &[]);
        assert!(matches!(step, Step::Insert(c) if c.status == FileStatus::Pending));
    }

    #[test]
    fn test_decide_committed_same_fingerprint() {
        let existing = entry(FileStatus::Committed, "fp1");
        let step = decide("ds", "a.csv", "fp1", Uuid::new_v4(), Some(&existing), &[]);
        assert_eq!(step, Step::Decided(LedgerDecision::AlreadyCommitted));
    }

    #[test]
    fn test_decide_committed_other_fingerprint_conflicts() {
        let existing = entry(FileStatus::Committed, "fp1");
        let step = decide("ds", "a.csv", "fp2", Uuid::new_v4(), Some(&existing), &[]);
        assert!(matches!(
            step,
            Step::Decided(LedgerDecision::ConflictingFingerprint(ref c))
                if c.committed_fingerprint == "fp1" && c.observed_fingerprint == "fp2"
        ));
        let step = decide(
            "ds",
            "a.csv",
            "fp2",
            Uuid::new_v4(),
            Some(&existing),
            &["fp2".to_string()],
        );
        assert_eq!(step, Step::Decided(LedgerDecision::AlreadyCommitted));
    }

    #[test]
    fn test_decide_failed() {
        let existing = entry(FileStatus::Failed, "fp1");
        assert!(matches!(
            decide("ds", "a.csv", "fp1", Uuid::new_v4(), Some(&existing), &[]),
            Step::Decided(LedgerDecision::PreviouslyFailed { .. })
        ));
        assert!(matches!(
            decide("ds", "a.csv", "fp2", Uuid::new_v4(), Some(&existing), &[]),
            Step::Swap { .. }
        ));
    }

    #[tokio::test]
    async fn test_claim_commit_then_skip() {
        let (ledger, store) = ledger();
        let run = Uuid::new_v4();
        let LedgerDecision::Proceed(claim) =
            ledger.try_begin_ingestion("ds", "a.csv", "fp1", run).await.unwrap()
        else {
            panic!("expected Proceed");
        };
        let outcome = ledger.commit(&claim, 1, &rows(3), 0).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
        assert_eq!(store.bronze_count("ds").await.unwrap(), 3);

        let again = ledger
            .try_begin_ingestion("ds", "a.csv", "fp1", Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(again, LedgerDecision::AlreadyCommitted);
        assert_eq!(store.bronze_count("ds").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_crashed_claim_is_taken_over() {
        let (ledger, store) = ledger();
        let LedgerDecision::Proceed(stale) = ledger
            .try_begin_ingestion("ds", "a.csv", "fp1", Uuid::new_v4())
            .await
            .unwrap()
        else {
            panic!("expected Proceed");
        };
        let LedgerDecision::Proceed(claim) = ledger
            .try_begin_ingestion("ds", "a.csv", "fp1", Uuid::new_v4())
            .await
            .unwrap()
        else {
            panic!("expected Proceed");
        };
        ledger.commit(&claim, 1, &rows(2), 0).await.unwrap();

        // The crashed run waking up finds the file already committed.
        let outcome = ledger.commit(&stale, 1, &rows(2), 0).await.unwrap();
        assert_eq!(outcome, CommitOutcome::AlreadyCommitted);
        assert_eq!(store.bronze_count("ds").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_conflict_blocks_until_acknowledged() {
        let (ledger, _store) = ledger();
        let LedgerDecision::Proceed(claim) = ledger
            .try_begin_ingestion("ds", "a.csv", "fp1", Uuid::new_v4())
            .await
            .unwrap()
        else {
            panic!("expected Proceed");
        };
        ledger.commit(&claim, 1, &rows(1), 0).await.unwrap();

        let decision = ledger
            .try_begin_ingestion("ds", "a.csv", "fp2", Uuid::new_v4())
            .await
            .unwrap();
        assert!(matches!(decision, LedgerDecision::ConflictingFingerprint(_)));
        let err = ledger.ensure_unblocked("ds").await.unwrap_err();
        assert!(matches!(
            err,
            StrataError::Ledger(LedgerError::DatasetBlocked { conflicts: 1, .. })
        ));

        assert_eq!(ledger.acknowledge("ds", "a.csv").await.unwrap(), 1);
        ledger.ensure_unblocked("ds").await.unwrap();
        let decision = ledger
            .try_begin_ingestion("ds", "a.csv", "fp2", Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(decision, LedgerDecision::AlreadyCommitted);
    }

    #[tokio::test]
    async fn test_failed_then_retry() {
        let (ledger, store) = ledger();
        let LedgerDecision::Proceed(claim) = ledger
            .try_begin_ingestion("ds", "bad.csv", "fp1", Uuid::new_v4())
            .await
            .unwrap()
        else {
            panic!("expected Proceed");
        };
        ledger
            .mark_failed(&claim, ErrorKind::PartialParseFailure, "too many bad rows")
            .await
            .unwrap();
        assert_eq!(store.bronze_count("ds").await.unwrap(), 0);

        let decision = ledger
            .try_begin_ingestion("ds", "bad.csv", "fp1", Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(
            decision,
            LedgerDecision::PreviouslyFailed {
                kind: Some(ErrorKind::PartialParseFailure),
                reason: Some("too many bad rows".into()),
            }
        );

        ledger.retry("ds", "bad.csv").await.unwrap();
        let queued = ledger.entry("ds", "bad.csv").await.unwrap().unwrap();
        assert_eq!(queued.status, FileStatus::Pending);
        assert_eq!(queued.failure_kind, None);
        assert_eq!(queued.claimed_by, None);
        assert!(matches!(
            ledger.retry("ds", "bad.csv").await.unwrap_err(),
            StrataError::Ledger(LedgerError::NotFailed { .. })
        ));
        assert!(matches!(
            ledger.retry("ds", "other.csv").await.unwrap_err(),
            StrataError::Ledger(LedgerError::NotFound { .. })
        ));

        // The queued entry is taken over like any Pending claim.
        let decision = ledger
            .try_begin_ingestion("ds", "bad.csv", "fp1", Uuid::new_v4())
            .await
            .unwrap();
        assert!(matches!(decision, LedgerDecision::Proceed(_)));
    }

    #[tokio::test]
    async fn test_acknowledge_without_conflict_is_error() {
        let (ledger, _store) = ledger();
        assert!(ledger.acknowledge("ds", "nope.csv").await.is_err());
    }
}
