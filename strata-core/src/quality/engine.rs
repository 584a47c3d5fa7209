//! Bronze to silver: validation, deduplication and anomaly annotation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::anomaly::{AnomalyContext, AnomalyPolicy, CompositePolicy};
use super::rules::{extract_key, missing_required, normalize, out_of_range};
use crate::aggregate::{WindowKey, WindowState};
use crate::config::DatasetConfig;
use crate::error::{PipelineError, QualityError, Result};
use crate::events::{EventSink, PipelineEvent};
use crate::schema::SchemaRegistry;
use crate::store::{SilverBatch, TableStore};
use crate::types::{Checkpoint, CleanRecord, QualityFlag, RawRecord, RecordKey, Stage, Supersession};

/// Summary of one quality pass over a dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub dataset: String,
    pub batches: u64,
    pub records_read: u64,
    pub records_written: u64,
    /// Rows without a usable entity key or event time.
    pub dropped: u64,
    pub superseded: u64,
    /// Re-delivered keys whose stored row sits in a closed window; the stored
    /// row is kept.
    pub late_rejected: u64,
    pub flag_counts: BTreeMap<QualityFlag, u64>,
    pub anomalies: u64,
    /// Bronze seq consumed up to.
    pub checkpoint: i64,
}

impl QualityReport {
    fn absorb(&mut self, batch: &BatchOutcome) {
        self.batches += 1;
        self.records_read += batch.read;
        self.records_written += batch.silver.records.len() as u64;
        self.dropped += batch.dropped;
        self.superseded += batch.silver.supersessions.len() as u64;
        self.late_rejected += batch.late_rejected;
        for (flag, count) in &batch.flag_counts {
            *self.flag_counts.entry(*flag).or_default() += count;
        }
        self.anomalies += batch.anomalies;
        self.checkpoint = batch.silver.checkpoint.position;
    }

    pub fn flag_count(&self, flag: QualityFlag) -> u64 {
        self.flag_counts.get(&flag).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    silver: SilverBatch,
    read: u64,
    dropped: u64,
    late_rejected: u64,
    flag_counts: BTreeMap<QualityFlag, u64>,
    anomalies: u64,
}

/// A keyed bronze row on its way to silver.
#[derive(Debug, Clone)]
struct Candidate {
    key: RecordKey,
    raw: RawRecord,
    fields: crate::types::Payload,
    flags: BTreeSet<QualityFlag>,
}

/// Turns newly landed bronze rows into silver.
#[derive(Clone)]
pub struct QualityEngine {
    store: Arc<dyn TableStore>,
    registry: Arc<SchemaRegistry>,
    events: Arc<dyn EventSink>,
    policies: HashMap<String, Arc<dyn AnomalyPolicy>>,
}

impl QualityEngine {
    pub fn new(
        store: Arc<dyn TableStore>,
        registry: Arc<SchemaRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            policies: HashMap::new(),
        }
    }

    /// Replace the built-in anomaly policies of one dataset.
    pub fn with_policy(mut self, dataset: impl Into<String>, policy: Arc<dyn AnomalyPolicy>) -> Self {
        self.policies.insert(dataset.into(), policy);
        self
    }

    fn policy_for(&self, dataset: &DatasetConfig) -> Arc<dyn AnomalyPolicy> {
        match self.policies.get(&dataset.name) {
            Some(policy) => Arc::clone(policy),
            None => Arc::new(CompositePolicy::for_dataset(dataset)),
        }
    }

    /// Process every bronze row after the silver checkpoint, one batch per
    /// transaction. Cancellation is honoured between batches.
    pub async fn process(
        &self,
        dataset: &DatasetConfig,
        cancel: &CancellationToken,
    ) -> Result<QualityReport> {
        let policy = self.policy_for(dataset);
        let mut report = QualityReport {
            dataset: dataset.name.clone(),
            ..Default::default()
        };

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    stage: Stage::Quality.to_string(),
                }
                .into());
            }
            let checkpoint = self.store.checkpoint(&dataset.name, Stage::Quality).await?;
            report.checkpoint = checkpoint.position;
            let bronze = self
                .store
                .bronze_after(&dataset.name, checkpoint.position, dataset.quality_batch_size)
                .await?;
            if bronze.is_empty() {
                break;
            }

            let outcome = self
                .process_batch(dataset, policy.as_ref(), &checkpoint, bronze)
                .await?;
            self.store.commit_silver(&outcome.silver).await?;

            let written = outcome.silver.records.len() as u64;
            self.events.emit(&PipelineEvent::AnomalyRate {
                dataset: dataset.name.clone(),
                records: written,
                anomalies: outcome.anomalies,
                rate: if written == 0 {
                    0.0
                } else {
                    outcome.anomalies as f64 / written as f64
                },
            });
            debug!(
                dataset = %dataset.name,
                read = outcome.read,
                written,
                dropped = outcome.dropped,
                late = outcome.late_rejected,
                superseded = outcome.silver.supersessions.len(),
                checkpoint = outcome.silver.checkpoint.position,
                "Silver batch committed"
            );
            report.absorb(&outcome);
        }

        info!(
            dataset = %dataset.name,
            batches = report.batches,
            read = report.records_read,
            written = report.records_written,
            dropped = report.dropped,
            superseded = report.superseded,
            anomalies = report.anomalies,
            "Quality pass complete"
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        dataset: &DatasetConfig,
        policy: &dyn AnomalyPolicy,
        checkpoint: &Checkpoint,
        bronze: Vec<RawRecord>,
    ) -> Result<BatchOutcome> {
        let name = dataset.name.as_str();
        let mut outcome = BatchOutcome {
            read: bronze.len() as u64,
            ..Default::default()
        };
        let last_seq = bronze.last().map_or(checkpoint.position, |r| r.seq);
        if last_seq < checkpoint.position {
            return Err(QualityError::CheckpointRegression {
                dataset: name.to_string(),
                current: checkpoint.position,
                proposed: last_seq,
            }
            .into());
        }

        let current_version = self.registry.current(name).await?.map_or(0, |v| v.version);
        let numeric_fields = dataset.numeric_fields();

        // Validate in arrival order.
        let mut last_arrival: HashMap<String, Option<DateTime<Utc>>> = HashMap::new();
        let mut candidates = Vec::with_capacity(bronze.len());
        for raw in bronze {
            let Some(key) = extract_key(
                &raw.payload,
                &dataset.entity_key,
                &dataset.timestamp_field,
                &dataset.timestamp_formats,
            ) else {
                outcome.dropped += 1;
                *outcome
                    .flag_counts
                    .entry(QualityFlag::MissingRequired)
                    .or_default() += 1;
                continue;
            };

            let mut flags = BTreeSet::new();
            let fields = normalize(&raw.payload, &numeric_fields);
            if !missing_required(&fields, &dataset.required_fields).is_empty() {
                flags.insert(QualityFlag::MissingRequired);
            }
            if !out_of_range(&fields, &dataset.ranges).is_empty() {
                flags.insert(QualityFlag::OutOfRange);
            }
            if raw.schema_version < current_version {
                flags.insert(QualityFlag::SchemaDrift);
            }

            let previous = match last_arrival.get(&key.entity_key) {
                Some(previous) => *previous,
                None => {
                    self.store
                        .silver_last_arrival(name, &key.entity_key)
                        .await?
                }
            };
            if previous.is_some_and(|p| key.event_time < p) {
                flags.insert(QualityFlag::OutOfOrder);
            }
            last_arrival.insert(key.entity_key.clone(), Some(key.event_time));

            candidates.push(Candidate {
                key,
                raw,
                fields,
                flags,
            });
        }

        // Deduplicate within the batch: the highest bronze seq wins.
        let mut winners: HashMap<RecordKey, Candidate> = HashMap::new();
        for candidate in candidates {
            match winners.remove(&candidate.key) {
                Some(loser) => {
                    outcome.silver.supersessions.push(supersession(name, &loser, &candidate));
                    let mut candidate = candidate;
                    candidate.flags.insert(QualityFlag::DuplicateKey);
                    winners.insert(candidate.key.clone(), candidate);
                }
                None => {
                    winners.insert(candidate.key.clone(), candidate);
                }
            }
        }

        // Deduplicate against silver. A stored row in a closed window stays.
        let keys: Vec<RecordKey> = winners.keys().cloned().collect();
        let existing = self.store.silver_existing(name, &keys).await?;
        let watermark = self
            .store
            .checkpoint(name, Stage::Aggregation)
            .await?
            .watermark;
        let mut survivors: Vec<Candidate> = Vec::with_capacity(winners.len());
        for (key, mut candidate) in winners {
            match existing.get(&key) {
                Some(&stored) if stored < candidate.raw.seq => {
                    if let Some(window) = self.closed_window(dataset, &key, watermark).await? {
                        warn!(
                            dataset = name,
                            entity = %key.entity_key,
                            window = %window,
                            event_time = %key.event_time,
                            horizon_hours = dataset.lateness_horizon_hours,
                            "Rejected re-delivered row beyond lateness horizon"
                        );
                        self.events.emit(&PipelineEvent::LatenessViolation {
                            dataset: name.to_string(),
                            entity_key: key.entity_key.clone(),
                            window_start: window.window_start,
                            event_time: key.event_time,
                            horizon_hours: dataset.lateness_horizon_hours,
                        });
                        outcome.silver.supersessions.push(Supersession {
                            dataset: name.to_string(),
                            bronze_seq: candidate.raw.seq,
                            superseded_by: stored,
                            entity_key: key.entity_key.clone(),
                            event_time: key.event_time,
                        });
                        outcome.late_rejected += 1;
                        continue;
                    }
                    outcome.silver.supersessions.push(Supersession {
                        dataset: name.to_string(),
                        bronze_seq: stored,
                        superseded_by: candidate.raw.seq,
                        entity_key: key.entity_key.clone(),
                        event_time: key.event_time,
                    });
                    candidate.flags.insert(QualityFlag::DuplicateKey);
                    survivors.push(candidate);
                }
                Some(&stored) if stored > candidate.raw.seq => {
                    outcome.silver.supersessions.push(Supersession {
                        dataset: name.to_string(),
                        bronze_seq: candidate.raw.seq,
                        superseded_by: stored,
                        entity_key: key.entity_key.clone(),
                        event_time: key.event_time,
                    });
                }
                _ => survivors.push(candidate),
            }
        }
        survivors.sort_by(|a, b| a.key.cmp(&b.key));

        let records = self.annotate(dataset, policy, survivors).await?;
        for record in &records {
            for flag in &record.flags {
                *outcome.flag_counts.entry(*flag).or_default() += 1;
            }
            if record.is_anomaly {
                outcome.anomalies += 1;
            }
        }
        outcome.silver.dataset = name.to_string();
        outcome.silver.records = records;
        outcome.silver.supersessions.sort_by_key(|s| s.bronze_seq);
        outcome.silver.checkpoint = Checkpoint {
            position: last_seq,
            watermark: None,
        };
        Ok(outcome)
    }

    /// A Fresh window of `key` already closed by the aggregation watermark.
    async fn closed_window(
        &self,
        dataset: &DatasetConfig,
        key: &RecordKey,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Option<WindowKey>> {
        let Some(watermark) = watermark else {
            return Ok(None);
        };
        let horizon = Duration::hours(dataset.lateness_horizon_hours as i64);
        for granularity in &dataset.granularities {
            let window =
                WindowKey::containing(&dataset.name, &key.entity_key, *granularity, key.event_time);
            let state = self
                .store
                .window_status(&window)
                .await?
                .map_or(WindowState::Stale, |s| s.state);
            if window.is_closed(state, horizon, watermark) {
                return Ok(Some(window));
            }
        }
        Ok(None)
    }

    /// Run the anomaly policy for each survivor against its entity's history.
    /// `survivors` must be sorted by key.
    async fn annotate(
        &self,
        dataset: &DatasetConfig,
        policy: &dyn AnomalyPolicy,
        survivors: Vec<Candidate>,
    ) -> Result<Vec<CleanRecord>> {
        let processed_at = Utc::now();
        let records: Vec<CleanRecord> = survivors
            .into_iter()
            .map(|c| CleanRecord {
                seq: 0,
                dataset: dataset.name.clone(),
                entity_key: c.key.entity_key,
                event_time: c.key.event_time,
                fields: c.fields,
                flags: c.flags,
                anomalies: Vec::new(),
                is_anomaly: false,
                bronze_seq: c.raw.seq,
                source_file: c.raw.source_file,
                schema_version: c.raw.schema_version,
                processed_at,
            })
            .collect();

        let mut by_entity: BTreeMap<String, Vec<CleanRecord>> = BTreeMap::new();
        for record in records {
            by_entity
                .entry(record.entity_key.clone())
                .or_default()
                .push(record);
        }

        let window = dataset.anomaly.history_window.max(1);
        let mut annotated = Vec::new();
        for (entity, batch) in by_entity {
            let stored = self
                .store
                .silver_recent(&dataset.name, &entity, window)
                .await?;
            let mut timeline: BTreeMap<DateTime<Utc>, CleanRecord> = stored
                .into_iter()
                .map(|r| (r.event_time, r))
                .collect();
            for record in &batch {
                timeline.insert(record.event_time, record.clone());
            }
            let timeline: Vec<CleanRecord> = timeline.into_values().collect();

            for mut record in batch {
                let before = timeline.partition_point(|r| r.event_time < record.event_time);
                let history = &timeline[before.saturating_sub(window)..before];
                let ctx = AnomalyContext {
                    dataset: &dataset.name,
                    record: &record,
                    history,
                };
                let anomalies = policy.evaluate(&ctx)?;
                record.is_anomaly = !anomalies.is_empty();
                record.anomalies = anomalies;
                annotated.push(record);
            }
        }
        Ok(annotated)
    }
}

fn supersession(dataset: &str, loser: &Candidate, winner: &Candidate) -> Supersession {
    Supersession {
        dataset: dataset.to_string(),
        bronze_seq: loser.raw.seq,
        superseded_by: winner.raw.seq,
        entity_key: winner.key.entity_key.clone(),
        event_time: winner.key.event_time,
    }
}
