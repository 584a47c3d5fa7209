//! Stage sequencing, retries and run bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::retry::{RetryPolicy, run_with_retry};
use crate::aggregate::{AggregationEngine, AggregationReport};
use crate::config::{DatasetConfig, PipelineConfig};
use crate::error::{ErrorKind, Result, StoreError, StrataError};
use crate::events::{EventSink, PipelineEvent};
use crate::ingest::{IngestionCoordinator, IngestionReport};
use crate::ledger::FileLedger;
use crate::quality::{QualityEngine, QualityReport};
use crate::schema::SchemaRegistry;
use crate::store::{LocalObjectStore, ObjectStore, SqliteTableStore, TableStore};
use crate::types::{FileStatus, PipelineRun, RunStatus, Stage, StageOutcome, StageReport};

/// Point-in-time view of one dataset for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStatus {
    pub dataset: String,
    pub schema_version: Option<u32>,
    pub files_committed: usize,
    pub files_failed: usize,
    pub files_pending: usize,
    pub open_conflicts: usize,
    pub bronze_rows: u64,
    pub silver_rows: u64,
    pub gold_rows: usize,
    pub last_run: Option<PipelineRun>,
}

/// How a stage attempt ended, as seen by the run.
enum Gate {
    Continue,
    Stop(RunStatus),
}

/// Runs Ingestion, Quality and Aggregation for configured datasets.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    store: Arc<dyn TableStore>,
    objects: Arc<dyn ObjectStore>,
    registry: Arc<SchemaRegistry>,
    events: Arc<dyn EventSink>,
    ingestion: IngestionCoordinator,
    quality: QualityEngine,
    aggregation: AggregationEngine,
    retry: RetryPolicy,
}

impl Pipeline {
    /// Validate `config` and wire the stages over the given collaborators.
    pub fn new(
        config: PipelineConfig,
        objects: Arc<dyn ObjectStore>,
        store: Arc<dyn TableStore>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        for warning in config.validate()? {
            warn!(%warning, "Configuration warning");
        }
        let registry = Arc::new(config.datasets.iter().fold(
            SchemaRegistry::new(Arc::clone(&store)),
            |registry, ds| registry.with_lattice(ds.name.clone(), ds.lattice()),
        ));
        let ingestion = IngestionCoordinator::new(
            Arc::clone(&objects),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&events),
            config.workers,
        );
        let quality = QualityEngine::new(Arc::clone(&store), Arc::clone(&registry), Arc::clone(&events));
        let aggregation = AggregationEngine::new(Arc::clone(&store), Arc::clone(&events));
        Ok(Self {
            retry: RetryPolicy::from_config(&config.retry),
            config: Arc::new(config),
            store,
            objects,
            registry,
            events,
            ingestion,
            quality,
            aggregation,
        })
    }

    /// Open the on-disk stores named by `config.storage`.
    pub fn open(config: PipelineConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        if let Some(parent) = config.storage.database.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::create_dir_all(&config.storage.object_root)?;
        let store: Arc<dyn TableStore> = Arc::new(SqliteTableStore::open(&config.storage.database)?);
        let objects: Arc<dyn ObjectStore> =
            Arc::new(LocalObjectStore::new(config.storage.object_root.clone()));
        Self::new(config, objects, store, events)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the anomaly policies of one dataset.
    pub fn with_anomaly_policy(
        mut self,
        dataset: impl Into<String>,
        policy: Arc<dyn crate::quality::AnomalyPolicy>,
    ) -> Self {
        self.quality = self.quality.with_policy(dataset, policy);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &FileLedger {
        self.ingestion.ledger()
    }

    /// Run every stage for one dataset. The returned run has already been
    /// persisted and announced.
    ///
    /// Errors are reserved for failures to record the run itself; stage
    /// failures end up in the run's status and error summary.
    pub async fn run_dataset(&self, name: &str, cancel: &CancellationToken) -> Result<PipelineRun> {
        let dataset = self.config.dataset(name)?;
        let mut run = PipelineRun::new(name);
        self.store.save_run(&run).await?;
        info!(dataset = name, run_id = %run.run_id, "Pipeline run started");

        let gate = self.ingest_stage(dataset, &mut run, cancel).await;
        let gate = match gate {
            Gate::Continue => self.quality_stage(dataset, &mut run, cancel).await,
            stop => stop,
        };
        let gate = match gate {
            Gate::Continue => self.aggregation_stage(dataset, &mut run, cancel).await,
            stop => stop,
        };

        let status = match gate {
            Gate::Stop(status) => status,
            Gate::Continue if run.error_summary.is_empty() => RunStatus::Succeeded,
            Gate::Continue => RunStatus::PartiallyFailed,
        };
        run.finish(status);
        self.store.save_run(&run).await?;
        self.events.emit(&PipelineEvent::RunFinished {
            run_id: run.run_id,
            dataset: run.dataset.clone(),
            status: run.status,
            records_processed: run.records_processed,
            errors: run.error_count(),
        });
        match run.status {
            RunStatus::Failed => error!(
                dataset = name,
                run_id = %run.run_id,
                stage = %run.stage,
                errors = run.error_count(),
                "Pipeline run failed"
            ),
            status => info!(
                dataset = name,
                run_id = %run.run_id,
                status = %status,
                records = run.records_processed,
                errors = run.error_count(),
                "Pipeline run finished"
            ),
        }
        Ok(run)
    }

    /// Run every configured dataset, at most `workers` at a time.
    pub async fn run_all(&self, cancel: &CancellationToken) -> Result<Vec<PipelineRun>> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut handles = Vec::with_capacity(self.config.datasets.len());
        for dataset in &self.config.datasets {
            let this = self.clone();
            let name = dataset.name.clone();
            let cancel = cancel.clone();
            let sem = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.map_err(|e| {
                    StrataError::from(StoreError::Task {
                        message: e.to_string(),
                    })
                })?;
                this.run_dataset(&name, &cancel).await
            }));
        }

        let mut runs = Vec::with_capacity(handles.len());
        let mut first_error: Option<StrataError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(run)) => runs.push(run),
                Ok(Err(e)) => {
                    error!(error = %e, "Could not record pipeline run");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(
                        StoreError::Task {
                            message: e.to_string(),
                        }
                        .into(),
                    );
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(runs),
        }
    }

    /// Run all datasets every `interval` until cancelled.
    pub async fn watch(&self, interval: Duration, cancel: &CancellationToken) -> Result<u64> {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut rounds = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let runs = self.run_all(cancel).await?;
            rounds += 1;
            let failed = runs.iter().filter(|r| r.status == RunStatus::Failed).count();
            info!(round = rounds, runs = runs.len(), failed, "Scheduled round complete");
        }
        info!(rounds, "Watch stopped");
        Ok(rounds)
    }

    /// Recompute gold windows of a dataset starting in `range`.
    pub async fn force_refresh(
        &self,
        name: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        cancel: &CancellationToken,
    ) -> Result<AggregationReport> {
        let dataset = self.config.dataset(name)?;
        self.aggregation.force_refresh(dataset, range, cancel).await
    }

    /// Most recent runs, newest first.
    pub async fn status(&self, dataset: Option<&str>, limit: usize) -> Result<Vec<PipelineRun>> {
        Ok(self.store.runs(dataset, limit).await?)
    }

    pub async fn dataset_status(&self, name: &str) -> Result<DatasetStatus> {
        self.config.dataset(name)?;
        let entries = self.ledger().entries(name, None).await?;
        let count = |status: FileStatus| entries.iter().filter(|e| e.status == status).count();
        Ok(DatasetStatus {
            dataset: name.to_string(),
            schema_version: self.registry.current(name).await?.map(|v| v.version),
            files_committed: count(FileStatus::Committed),
            files_failed: count(FileStatus::Failed),
            files_pending: count(FileStatus::Pending),
            open_conflicts: self.ledger().conflicts(name, false).await?.len(),
            bronze_rows: self.store.bronze_count(name).await?,
            silver_rows: self.store.silver_count(name).await?,
            gold_rows: self.store.gold_rows(name, None, None).await?.len(),
            last_run: self.store.runs(Some(name), 1).await?.into_iter().next(),
        })
    }

    async fn ingest_stage(
        &self,
        dataset: &DatasetConfig,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Gate {
        run.stage = Stage::Ingestion;
        let started_at = Utc::now();
        let run_id = run.run_id;
        let (result, attempts) = run_with_retry(&self.retry, Stage::Ingestion, cancel, |_| {
            self.ingestion.run(dataset, run_id, cancel)
        })
        .await;
        let report: IngestionReport = match result {
            Ok(report) => report,
            Err(e) => return fail_stage(run, Stage::Ingestion, attempts, started_at, e),
        };

        for failure in report.failed.iter().chain(&report.previously_failed) {
            run.record_error(failure.kind, format!("{}: {}", failure.file, failure.reason));
        }
        for file in &report.conflicts {
            run.record_error(
                ErrorKind::LedgerConflict,
                format!("{file}: content changed after commit"),
            );
        }
        run.record_errors(
            ErrorKind::PartialParseFailure,
            report.row_errors,
            Some(format!("{} unparseable rows in committed files", report.row_errors)),
        );
        run.records_processed += report.rows_written;

        let blocked = !report.conflicts.is_empty();
        let outcome = if blocked {
            StageOutcome::Failed
        } else if report.has_failures() || report.row_errors > 0 {
            StageOutcome::CompletedWithErrors
        } else {
            StageOutcome::Succeeded
        };
        run.stages.push(StageReport {
            stage: Stage::Ingestion,
            outcome,
            attempts,
            records_processed: report.rows_written,
            started_at,
            ended_at: Utc::now(),
            message: Some(format!(
                "{} committed, {} skipped, {} failed, {} conflicts",
                report.committed,
                report.skipped,
                report.failed.len() + report.previously_failed.len(),
                report.conflicts.len()
            )),
        });
        if blocked {
            Gate::Stop(RunStatus::Failed)
        } else {
            Gate::Continue
        }
    }

    async fn quality_stage(
        &self,
        dataset: &DatasetConfig,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Gate {
        run.stage = Stage::Quality;
        let started_at = Utc::now();
        let (result, attempts) = run_with_retry(&self.retry, Stage::Quality, cancel, |_| {
            self.quality.process(dataset, cancel)
        })
        .await;
        let report: QualityReport = match result {
            Ok(report) => report,
            Err(e) => return fail_stage(run, Stage::Quality, attempts, started_at, e),
        };
        run.record_errors(
            ErrorKind::LatenessViolation,
            report.late_rejected,
            Some(format!(
                "{} re-delivered rows beyond the {}h lateness horizon kept their stored value",
                report.late_rejected, dataset.lateness_horizon_hours
            )),
        );
        run.records_processed += report.records_read;
        run.stages.push(StageReport {
            stage: Stage::Quality,
            outcome: if report.late_rejected == 0 {
                StageOutcome::Succeeded
            } else {
                StageOutcome::CompletedWithErrors
            },
            attempts,
            records_processed: report.records_read,
            started_at,
            ended_at: Utc::now(),
            message: Some(format!(
                "{} written, {} superseded, {} dropped, {} anomalies",
                report.records_written, report.superseded, report.dropped, report.anomalies
            )),
        });
        Gate::Continue
    }

    async fn aggregation_stage(
        &self,
        dataset: &DatasetConfig,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Gate {
        run.stage = Stage::Aggregation;
        let started_at = Utc::now();
        let (result, attempts) = run_with_retry(&self.retry, Stage::Aggregation, cancel, |_| {
            self.aggregation.process(dataset, cancel)
        })
        .await;
        let report = match result {
            Ok(report) => report,
            Err(e) => return fail_stage(run, Stage::Aggregation, attempts, started_at, e),
        };

        run.record_errors(
            ErrorKind::LatenessViolation,
            report.late_rejected,
            Some(format!(
                "{} rows beyond the {}h lateness horizon",
                report.late_rejected, dataset.lateness_horizon_hours
            )),
        );
        for inconsistency in &report.inconsistencies {
            run.record_error(ErrorKind::AggregationInconsistency, inconsistency.clone());
        }
        let clean = report.late_rejected == 0 && report.inconsistencies.is_empty();
        run.stages.push(StageReport {
            stage: Stage::Aggregation,
            outcome: if clean {
                StageOutcome::Succeeded
            } else {
                StageOutcome::CompletedWithErrors
            },
            attempts,
            records_processed: report.rows_scanned,
            started_at,
            ended_at: Utc::now(),
            message: Some(format!(
                "{} windows refreshed, {} days deferred",
                report.windows_refreshed, report.days_deferred
            )),
        });
        Gate::Continue
    }
}

fn fail_stage(
    run: &mut PipelineRun,
    stage: Stage,
    attempts: u32,
    started_at: DateTime<Utc>,
    err: StrataError,
) -> Gate {
    let kind = err.kind();
    let outcome = if kind == ErrorKind::Cancelled {
        StageOutcome::Cancelled
    } else {
        StageOutcome::Failed
    };
    warn!(dataset = %run.dataset, stage = %stage, kind = %kind, error = %err, "Stage failed");
    run.record_error(kind, err.to_string());
    run.stages.push(StageReport {
        stage,
        outcome,
        attempts,
        records_processed: 0,
        started_at,
        ended_at: Utc::now(),
        message: Some(err.to_string()),
    });
    Gate::Stop(RunStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::types::Granularity;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> PipelineConfig {
        let mut ds = DatasetConfig::new("sensors", "sensors/");
        ds.metric_fields = vec!["temperature".into()];
        ds.anomaly.max_gap_secs = None;
        let mut config = PipelineConfig {
            datasets: vec![ds],
            workers: 2,
            ..PipelineConfig::default()
        };
        config.storage.object_root = dir.path().join("landing");
        config.storage.database = dir.path().join("db").join("strata.db");
        config
    }

    fn pipeline(dir: &TempDir) -> (Pipeline, Arc<MemoryEventSink>) {
        let events = Arc::new(MemoryEventSink::new());
        let pipeline = Pipeline::open(config(dir), events.clone())
            .unwrap()
            .with_retry_policy(RetryPolicy::none());
        (pipeline, events)
    }

    #[tokio::test]
    async fn test_run_succeeds_end_to_end() {
        let dir = TempDir::new().unwrap();
        let (pipeline, events) = pipeline(&dir);
        pipeline
            .objects()
            .put(
                "sensors/a.csv",
                b"sensor_id,timestamp,temperature\nS1,2024-01-01 10:00:00,20\nS1,2024-01-01 10:30:00,22\n",
            )
            .await
            .unwrap();

        let run = pipeline
            .run_dataset("sensors", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.error_summary);
        assert_eq!(run.stages.len(), 3);
        assert!(run.ended_at.is_some());
        assert_eq!(events.named("run_finished").len(), 1);

        let gold = pipeline
            .store()
            .gold_rows("sensors", Some("S1"), Some(Granularity::Hour))
            .await
            .unwrap();
        assert_eq!(gold.len(), 1);
        assert_eq!(gold[0].metrics["temperature"].mean, 21.0);

        let history = pipeline.status(Some("sensors"), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Succeeded);

        let status = pipeline.dataset_status("sensors").await.unwrap();
        assert_eq!(status.schema_version, Some(1));
        assert_eq!(status.files_committed, 1);
        assert_eq!(status.bronze_rows, 2);
        assert_eq!(status.silver_rows, 2);
        assert_eq!(status.gold_rows, 2);
    }

    #[tokio::test]
    async fn test_failed_file_makes_run_partial() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(&dir);
        pipeline
            .objects()
            .put("sensors/bad.csv", b"sensor_id,timestamp\n\"unterminated\n")
            .await
            .unwrap();
        let run = pipeline
            .run_dataset("sensors", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::PartiallyFailed);
        assert!(
            run.error_summary
                .iter()
                .any(|i| i.kind == ErrorKind::PartialParseFailure)
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_is_failed() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(&dir);
        pipeline
            .objects()
            .put("sensors/a.csv", b"sensor_id,timestamp\nS1,2024-01-01 10:00:00\n")
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = pipeline.run_dataset("sensors", &cancel).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_summary[0].kind, ErrorKind::Cancelled);
        assert_eq!(run.stages[0].outcome, StageOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_dataset() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(&dir);
        let err = pipeline
            .run_dataset("nope", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Config(_)));
    }

    #[tokio::test]
    async fn test_run_all_and_watch_stop_on_cancel() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(&dir);
        let runs = pipeline.run_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let rounds = pipeline
            .watch(Duration::from_secs(3600), &cancel)
            .await
            .unwrap();
        assert_eq!(rounds, 0);
    }
}
