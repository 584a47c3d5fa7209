//! Silver to gold: incremental window maintenance.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::window::{WindowKey, WindowState, WindowStatus};
use crate::config::DatasetConfig;
use crate::error::{AggregationError, PipelineError, Result};
use crate::events::{EventSink, PipelineEvent};
use crate::store::TableStore;
use crate::types::{
    AggregateRow, Checkpoint, CleanRecord, Granularity, LateRejection, MetricSummary, QualityFlag,
    Stage,
};

/// Summary of one aggregation pass over a dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationReport {
    pub dataset: String,
    pub rows_scanned: u64,
    pub windows_marked: u64,
    pub windows_refreshed: u64,
    pub late_rejected: u64,
    /// Day windows left Dirty because an Hour of the same day is not Fresh.
    pub days_deferred: u64,
    /// Windows whose refresh diverged, as `window: message`.
    pub inconsistencies: Vec<String>,
    pub checkpoint: i64,
    pub watermark: Option<DateTime<Utc>>,
}

/// Result of refreshing a single window.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Refreshed(AggregateRow),
    Inconsistent(String),
    Deferred,
}

/// Recompute one window from its silver rows.
///
/// Pure: the same rows, config and `now` always give the same row.
pub fn compute_window(
    key: &WindowKey,
    rows: &[CleanRecord],
    dataset: &DatasetConfig,
    now: DateTime<Utc>,
) -> AggregateRow {
    let mut metrics = BTreeMap::new();
    for field in &dataset.metric_fields {
        let values: Vec<f64> = rows
            .iter()
            .filter(|r| dataset.aggregate_flagged || !r.has_flag(QualityFlag::OutOfRange))
            .filter_map(|r| r.numeric(field))
            .filter(|v| v.is_finite())
            .collect();
        if let Some(summary) = summarize(&values) {
            metrics.insert(field.clone(), summary);
        }
    }

    AggregateRow {
        dataset: key.dataset.clone(),
        entity_key: key.entity_key.clone(),
        granularity: key.granularity,
        window_start: key.window_start,
        metrics,
        source_record_count: rows.len() as u64,
        anomaly_count: rows.iter().filter(|r| r.is_anomaly).count() as u64,
        flagged_count: rows.iter().filter(|r| !r.flags.is_empty()).count() as u64,
        input_digest: input_digest(rows, dataset),
        last_refreshed_at: now,
    }
}

fn summarize(values: &[f64]) -> Option<MetricSummary> {
    let (first, rest) = values.split_first()?;
    let mut summary = MetricSummary {
        count: 1,
        sum: *first,
        min: *first,
        max: *first,
        mean: 0.0,
    };
    for &v in rest {
        summary.count += 1;
        summary.sum += v;
        summary.min = summary.min.min(v);
        summary.max = summary.max.max(v);
    }
    summary.mean = summary.sum / summary.count as f64;
    Some(summary)
}

/// SHA-256 over the window's inputs and the settings that shape its values.
/// Independent of silver sequence numbers, so re-delivered identical data
/// digests the same.
pub fn input_digest(rows: &[CleanRecord], dataset: &DatasetConfig) -> String {
    let mut hasher = Sha256::new();
    let settings = serde_json::json!({
        "metric_fields": dataset.metric_fields,
        "aggregate_flagged": dataset.aggregate_flagged,
    });
    hasher.update(settings.to_string().as_bytes());
    for r in rows {
        let line = serde_json::json!([
            r.event_time.timestamp_millis(),
            r.fields,
            r.flags,
            r.is_anomaly,
        ]);
        hasher.update(b"\n");
        hasher.update(line.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Maintains gold windows from silver rows.
#[derive(Clone)]
pub struct AggregationEngine {
    store: Arc<dyn TableStore>,
    events: Arc<dyn EventSink>,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn TableStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Mark windows touched by new silver rows and refresh every pending one.
    pub async fn process(
        &self,
        dataset: &DatasetConfig,
        cancel: &CancellationToken,
    ) -> Result<AggregationReport> {
        let mut report = AggregationReport {
            dataset: dataset.name.clone(),
            ..Default::default()
        };
        self.mark_dirty(dataset, cancel, &mut report).await?;
        self.refresh_pending(dataset, None, false, cancel, &mut report)
            .await?;
        info!(
            dataset = %dataset.name,
            scanned = report.rows_scanned,
            marked = report.windows_marked,
            refreshed = report.windows_refreshed,
            late = report.late_rejected,
            deferred = report.days_deferred,
            inconsistencies = report.inconsistencies.len(),
            "Aggregation pass complete"
        );
        Ok(report)
    }

    /// Recompute every known window starting in `range` (all windows when
    /// `None`), refreshing Day windows regardless of their Hours.
    pub async fn force_refresh(
        &self,
        dataset: &DatasetConfig,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        cancel: &CancellationToken,
    ) -> Result<AggregationReport> {
        let mut report = AggregationReport {
            dataset: dataset.name.clone(),
            ..Default::default()
        };
        self.mark_dirty(dataset, cancel, &mut report).await?;

        let now = Utc::now();
        for status in self.store.windows(&dataset.name, range).await? {
            if status.state == WindowState::Dirty {
                continue;
            }
            let state = status.state.transition(WindowState::Dirty)?;
            self.store
                .set_window_state(&WindowStatus {
                    key: status.key,
                    state,
                    updated_at: now,
                })
                .await?;
            report.windows_marked += 1;
        }
        self.refresh_pending(dataset, range, true, cancel, &mut report)
            .await?;
        info!(
            dataset = %dataset.name,
            refreshed = report.windows_refreshed,
            inconsistencies = report.inconsistencies.len(),
            "Forced refresh complete"
        );
        Ok(report)
    }

    /// Scan silver rows after the aggregation checkpoint, one batch per
    /// transaction, marking their windows Dirty or rejecting late rows.
    async fn mark_dirty(
        &self,
        dataset: &DatasetConfig,
        cancel: &CancellationToken,
        report: &mut AggregationReport,
    ) -> Result<()> {
        let name = dataset.name.as_str();
        let horizon = Duration::hours(dataset.lateness_horizon_hours as i64);
        let mut checkpoint = self.store.checkpoint(name, Stage::Aggregation).await?;
        let batch_size = dataset.quality_batch_size.max(1);

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    stage: Stage::Aggregation.to_string(),
                }
                .into());
            }
            let rows = self
                .store
                .silver_after(name, checkpoint.position, batch_size)
                .await?;
            let Some(last) = rows.last() else {
                break;
            };
            let position = last.seq;

            let mut states: HashMap<WindowKey, WindowState> = HashMap::new();
            let mut dirty: BTreeSet<WindowKey> = BTreeSet::new();
            let mut rejections = Vec::new();
            let mut watermark = checkpoint.watermark;

            for row in &rows {
                let touched: Vec<WindowKey> = dataset
                    .granularities
                    .iter()
                    .map(|g| WindowKey::containing(name, &row.entity_key, *g, row.event_time))
                    .collect();

                let mut late_window = None;
                if let Some(mark) = watermark {
                    for key in &touched {
                        let state = match states.get(key) {
                            Some(state) => *state,
                            None => {
                                let state = self
                                    .store
                                    .window_status(key)
                                    .await?
                                    .map_or(WindowState::Stale, |s| s.state);
                                states.insert(key.clone(), state);
                                state
                            }
                        };
                        if key.is_closed(state, horizon, mark) {
                            late_window = Some(key.clone());
                            break;
                        }
                    }
                }

                if let Some(key) = late_window {
                    warn!(
                        dataset = name,
                        entity = %row.entity_key,
                        window = %key,
                        event_time = %row.event_time,
                        horizon_hours = dataset.lateness_horizon_hours,
                        "Rejected row beyond lateness horizon"
                    );
                    self.events.emit(&PipelineEvent::LatenessViolation {
                        dataset: name.to_string(),
                        entity_key: row.entity_key.clone(),
                        window_start: key.window_start,
                        event_time: row.event_time,
                        horizon_hours: dataset.lateness_horizon_hours,
                    });
                    rejections.push(LateRejection {
                        dataset: name.to_string(),
                        silver_seq: row.seq,
                        entity_key: row.entity_key.clone(),
                        window_start: key.window_start,
                        event_time: row.event_time,
                        rejected_at: Utc::now(),
                    });
                    continue;
                }

                for key in touched {
                    states.insert(key.clone(), WindowState::Dirty);
                    dirty.insert(key);
                }
                watermark = Some(watermark.map_or(row.event_time, |w| w.max(row.event_time)));
            }

            let dirty: Vec<WindowKey> = dirty.into_iter().collect();
            checkpoint = Checkpoint {
                position,
                watermark,
            };
            self.store
                .commit_window_marks(name, &dirty, &rejections, &checkpoint)
                .await?;
            debug!(
                dataset = name,
                rows = rows.len(),
                dirty = dirty.len(),
                late = rejections.len(),
                position,
                "Marked windows"
            );

            report.rows_scanned += rows.len() as u64;
            report.windows_marked += dirty.len() as u64;
            report.late_rejected += rejections.len() as u64;
            if rows.len() < batch_size {
                break;
            }
        }

        report.checkpoint = checkpoint.position;
        report.watermark = checkpoint.watermark;
        Ok(())
    }

    /// Refresh pending windows: every Hour first, then the Days whose Hours
    /// are all Fresh (or every Day when `force` is set).
    async fn refresh_pending(
        &self,
        dataset: &DatasetConfig,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        force: bool,
        cancel: &CancellationToken,
        report: &mut AggregationReport,
    ) -> Result<()> {
        let mut pending: Vec<WindowKey> = self
            .store
            .windows(&dataset.name, range)
            .await?
            .into_iter()
            .filter(|s| s.state.is_pending() && dataset.granularities.contains(&s.key.granularity))
            .map(|s| s.key)
            .collect();
        pending.sort_by_key(|k| (k.granularity, k.entity_key.clone(), k.window_start));

        for key in pending {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    stage: Stage::Aggregation.to_string(),
                }
                .into());
            }
            match self.refresh_window(dataset, &key, force).await? {
                RefreshOutcome::Refreshed(_) => report.windows_refreshed += 1,
                RefreshOutcome::Inconsistent(message) => {
                    report.inconsistencies.push(format!("{key}: {message}"));
                }
                RefreshOutcome::Deferred => report.days_deferred += 1,
            }
        }
        Ok(())
    }

    /// Recompute one window from the current silver snapshot and commit it.
    ///
    /// A Day window is deferred while any recorded Hour of that day is not
    /// Fresh, unless `force` is set or Hours are not aggregated at all.
    pub async fn refresh_window(
        &self,
        dataset: &DatasetConfig,
        key: &WindowKey,
        force: bool,
    ) -> Result<RefreshOutcome> {
        let current = self
            .store
            .window_status(key)
            .await?
            .map_or(WindowState::Stale, |s| s.state);
        let hours_checked = key.granularity == Granularity::Day
            && !force
            && dataset.granularities.contains(&Granularity::Hour);
        let hours = if hours_checked {
            match self.fresh_hours(key).await? {
                Some(hours) => Some(hours),
                None => {
                    debug!(window = %key, "Day waits for its hours");
                    return Ok(RefreshOutcome::Deferred);
                }
            }
        } else {
            None
        };

        // A window abandoned mid-refresh starts over from Dirty.
        let state = match current {
            WindowState::Refreshing => WindowState::Dirty,
            other => other,
        };
        let refreshing = state.transition(WindowState::Refreshing)?;
        self.set_state(key, refreshing).await?;

        match self.recompute(dataset, key, hours.as_deref()).await {
            Ok(Ok(row)) => {
                self.store.commit_refresh(&row).await?;
                self.events.emit(&PipelineEvent::WindowRefreshed {
                    dataset: row.dataset.clone(),
                    entity_key: row.entity_key.clone(),
                    granularity: row.granularity,
                    window_start: row.window_start,
                    source_record_count: row.source_record_count,
                });
                debug!(window = %key, records = row.source_record_count, "Refreshed window");
                Ok(RefreshOutcome::Refreshed(row))
            }
            Ok(Err(AggregationError::Inconsistency { window, message })) => {
                self.set_state(key, refreshing.transition(WindowState::Dirty)?)
                    .await?;
                warn!(window = %window, %message, "Aggregation inconsistency");
                self.events.emit(&PipelineEvent::AggregationInconsistency {
                    dataset: key.dataset.clone(),
                    window,
                    message: message.clone(),
                });
                Ok(RefreshOutcome::Inconsistent(message))
            }
            Ok(Err(other)) => {
                self.set_state(key, WindowState::Dirty).await?;
                Err(other.into())
            }
            Err(e) => {
                if let Err(reset) = self.set_state(key, WindowState::Dirty).await {
                    warn!(window = %key, error = %reset, "Failed to reset window after error");
                }
                Err(e)
            }
        }
    }

    /// Hour rows of the Day `key`, or `None` when an Hour is not Fresh.
    async fn fresh_hours(&self, key: &WindowKey) -> Result<Option<Vec<AggregateRow>>> {
        let day_end = key.window_end();
        let statuses = self
            .store
            .windows(&key.dataset, Some((key.window_start, day_end)))
            .await?;
        let mut rows = Vec::new();
        for status in statuses
            .iter()
            .filter(|s| s.key.entity_key == key.entity_key && s.key.granularity == Granularity::Hour)
        {
            if status.state != WindowState::Fresh {
                return Ok(None);
            }
            if let Some(row) = self.store.gold_row(&status.key).await? {
                rows.push(row);
            }
        }
        Ok(Some(rows))
    }

    /// Compute the window and check it against what is already known.
    async fn recompute(
        &self,
        dataset: &DatasetConfig,
        key: &WindowKey,
        hours: Option<&[AggregateRow]>,
    ) -> Result<std::result::Result<AggregateRow, AggregationError>> {
        let rows = self
            .store
            .silver_window(&key.dataset, &key.entity_key, key.window_start, key.window_end())
            .await?;
        let row = compute_window(key, &rows, dataset, Utc::now());

        if let Some(stored) = self.store.gold_row(key).await? {
            if stored.input_digest == row.input_digest && !stored.same_values(&row) {
                return Ok(Err(AggregationError::Inconsistency {
                    window: key.to_string(),
                    message: "unchanged inputs produced different values".to_string(),
                }));
            }
        }
        if let Some(hours) = hours {
            let hour_total: u64 = hours.iter().map(|h| h.source_record_count).sum();
            if hour_total != row.source_record_count {
                return Ok(Err(AggregationError::Inconsistency {
                    window: key.to_string(),
                    message: format!(
                        "day counts {} records, its hours count {}",
                        row.source_record_count, hour_total
                    ),
                }));
            }
        }
        Ok(Ok(row))
    }

    async fn set_state(&self, key: &WindowKey, state: WindowState) -> Result<()> {
        self.store
            .set_window_state(&WindowStatus {
                key: key.clone(),
                state,
                updated_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::store::{SilverBatch, SqliteTableStore};
    use chrono::TimeZone;
    use serde_json::{Value, json};

    struct Harness {
        store: Arc<dyn TableStore>,
        events: Arc<MemoryEventSink>,
        engine: AggregationEngine,
        next_bronze: i64,
    }

    fn harness() -> Harness {
        let store: Arc<dyn TableStore> = Arc::new(SqliteTableStore::open_in_memory().unwrap());
        let events = Arc::new(MemoryEventSink::new());
        let engine = AggregationEngine::new(Arc::clone(&store), events.clone());
        Harness {
            store,
            events,
            engine,
            next_bronze: 0,
        }
    }

    fn dataset() -> DatasetConfig {
        let mut ds = DatasetConfig::new("sensors", "sensors/");
        ds.metric_fields = vec!["temperature".into()];
        ds.lateness_horizon_hours = 48;
        ds
    }

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, m, 0).unwrap()
    }

    fn record(entity: &str, t: DateTime<Utc>, temperature: f64) -> CleanRecord {
        let fields = match json!({ "sensor_id": entity, "temperature": temperature }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        CleanRecord {
            seq: 0,
            dataset: "sensors".into(),
            entity_key: entity.into(),
            event_time: t,
            fields,
            flags: BTreeSet::new(),
            anomalies: Vec::new(),
            is_anomaly: false,
            bronze_seq: 0,
            source_file: "a.csv".into(),
            schema_version: 1,
            processed_at: t,
        }
    }

    async fn land(h: &mut Harness, mut records: Vec<CleanRecord>) {
        for r in &mut records {
            h.next_bronze += 1;
            r.bronze_seq = h.next_bronze;
        }
        let batch = SilverBatch {
            dataset: "sensors".into(),
            records,
            supersessions: Vec::new(),
            checkpoint: Checkpoint {
                position: h.next_bronze,
                watermark: None,
            },
        };
        h.store.commit_silver(&batch).await.unwrap();
    }

    fn hour(t: DateTime<Utc>) -> WindowKey {
        WindowKey::containing("sensors", "S1", Granularity::Hour, t)
    }

    fn day(t: DateTime<Utc>) -> WindowKey {
        WindowKey::containing("sensors", "S1", Granularity::Day, t)
    }

    #[test]
    fn test_compute_window_excludes_out_of_range() {
        let ds = dataset();
        let mut flagged = record("S1", at(1, 10, 5), 900.0);
        flagged.flags.insert(QualityFlag::OutOfRange);
        let rows = vec![record("S1", at(1, 10, 0), 20.0), record("S1", at(1, 10, 1), 22.0), flagged];
        let row = compute_window(&hour(at(1, 10, 0)), &rows, &ds, at(2, 0, 0));
        let temp = &row.metrics["temperature"];
        assert_eq!(temp.count, 2);
        assert_eq!(temp.sum, 42.0);
        assert_eq!(temp.min, 20.0);
        assert_eq!(temp.max, 22.0);
        assert_eq!(temp.mean, 21.0);
        assert_eq!(row.source_record_count, 3);
        assert_eq!(row.flagged_count, 1);

        let mut including = ds.clone();
        including.aggregate_flagged = true;
        let row2 = compute_window(&hour(at(1, 10, 0)), &rows, &including, at(2, 0, 0));
        assert_eq!(row2.metrics["temperature"].count, 3);
        assert_ne!(row.input_digest, row2.input_digest);
    }

    #[test]
    fn test_compute_window_is_deterministic() {
        let ds = dataset();
        let rows = vec![record("S1", at(1, 10, 0), 20.0), record("S1", at(1, 10, 1), 22.5)];
        let a = compute_window(&hour(at(1, 10, 0)), &rows, &ds, at(2, 0, 0));
        let b = compute_window(&hour(at(1, 10, 0)), &rows, &ds, at(3, 0, 0));
        assert_ne!(a.last_refreshed_at, b.last_refreshed_at);
        assert!(a.same_values(&b));
    }

    #[test]
    fn test_empty_window_has_no_metrics() {
        let row = compute_window(&hour(at(1, 10, 0)), &[], &dataset(), at(2, 0, 0));
        assert!(row.metrics.is_empty());
        assert_eq!(row.source_record_count, 0);
    }

    #[tokio::test]
    async fn test_hours_and_day_refresh() {
        let mut h = harness();
        land(
            &mut h,
            vec![
                record("S1", at(1, 10, 0), 20.0),
                record("S1", at(1, 10, 30), 22.0),
                record("S1", at(1, 11, 0), 30.0),
            ],
        )
        .await;

        let report = h
            .engine
            .process(&dataset(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.rows_scanned, 3);
        assert_eq!(report.windows_marked, 3);
        assert_eq!(report.windows_refreshed, 3);
        assert!(report.inconsistencies.is_empty());

        let ten = h.store.gold_row(&hour(at(1, 10, 0))).await.unwrap().unwrap();
        assert_eq!(ten.source_record_count, 2);
        assert_eq!(ten.metrics["temperature"].mean, 21.0);
        let d = h.store.gold_row(&day(at(1, 0, 0))).await.unwrap().unwrap();
        assert_eq!(d.source_record_count, 3);
        assert_eq!(d.metrics["temperature"].max, 30.0);
        assert_eq!(h.events.named("window_refreshed").len(), 3);

        let status = h.store.window_status(&day(at(1, 0, 0))).await.unwrap().unwrap();
        assert_eq!(status.state, WindowState::Fresh);
    }

    #[tokio::test]
    async fn test_rerun_without_new_rows_is_noop() {
        let mut h = harness();
        land(&mut h, vec![record("S1", at(1, 10, 0), 20.0)]).await;
        let ds = dataset();
        let cancel = CancellationToken::new();
        h.engine.process(&ds, &cancel).await.unwrap();
        let again = h.engine.process(&ds, &cancel).await.unwrap();
        assert_eq!(again.rows_scanned, 0);
        assert_eq!(again.windows_refreshed, 0);
    }

    #[tokio::test]
    async fn test_late_row_within_horizon_recomputes() {
        let mut h = harness();
        let ds = dataset();
        let cancel = CancellationToken::new();
        land(
            &mut h,
            vec![record("S1", at(1, 10, 0), 20.0), record("S1", at(2, 9, 0), 25.0)],
        )
        .await;
        h.engine.process(&ds, &cancel).await.unwrap();

        land(&mut h, vec![record("S1", at(1, 10, 15), 30.0)]).await;
        let report = h.engine.process(&ds, &cancel).await.unwrap();
        assert_eq!(report.late_rejected, 0);
        assert_eq!(report.windows_refreshed, 2);

        let ten = h.store.gold_row(&hour(at(1, 10, 0))).await.unwrap().unwrap();
        assert_eq!(ten.source_record_count, 2);
        let d = h.store.gold_row(&day(at(1, 0, 0))).await.unwrap().unwrap();
        assert_eq!(d.metrics["temperature"].sum, 50.0);
    }

    #[tokio::test]
    async fn test_late_row_beyond_horizon_is_rejected() {
        let mut h = harness();
        let ds = dataset();
        let cancel = CancellationToken::new();
        land(
            &mut h,
            vec![record("S1", at(1, 10, 0), 20.0), record("S1", at(5, 9, 0), 25.0)],
        )
        .await;
        h.engine.process(&ds, &cancel).await.unwrap();
        let before = h.store.gold_row(&hour(at(1, 10, 0))).await.unwrap().unwrap();

        land(&mut h, vec![record("S1", at(1, 10, 15), 99.0)]).await;
        let report = h.engine.process(&ds, &cancel).await.unwrap();
        assert_eq!(report.late_rejected, 1);
        assert_eq!(report.windows_refreshed, 0);
        assert_eq!(h.events.named("lateness_violation").len(), 1);
        assert_eq!(h.store.late_rejections("sensors").await.unwrap().len(), 1);

        let after = h.store.gold_row(&hour(at(1, 10, 0))).await.unwrap().unwrap();
        assert!(before.same_values(&after));

        // A forced refresh still leaves the rejected row out.
        let forced = h.engine.force_refresh(&ds, None, &cancel).await.unwrap();
        assert!(forced.inconsistencies.is_empty());
        let forced_row = h.store.gold_row(&hour(at(1, 10, 0))).await.unwrap().unwrap();
        assert_eq!(forced_row.source_record_count, 1);
    }

    #[tokio::test]
    async fn test_day_deferred_until_hours_fresh() {
        let mut h = harness();
        let ds = dataset();
        land(&mut h, vec![record("S1", at(1, 10, 0), 20.0)]).await;
        h.engine.process(&ds, &CancellationToken::new()).await.unwrap();

        h.store
            .set_window_state(&WindowStatus {
                key: hour(at(1, 10, 0)),
                state: WindowState::Dirty,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        h.store
            .set_window_state(&WindowStatus {
                key: day(at(1, 0, 0)),
                state: WindowState::Dirty,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let outcome = h
            .engine
            .refresh_window(&ds, &day(at(1, 0, 0)), false)
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::Deferred);
        let forced = h
            .engine
            .refresh_window(&ds, &day(at(1, 0, 0)), true)
            .await
            .unwrap();
        assert!(matches!(forced, RefreshOutcome::Refreshed(_)));
    }

    #[tokio::test]
    async fn test_changed_values_with_same_inputs_is_inconsistent() {
        let mut h = harness();
        let ds = dataset();
        land(&mut h, vec![record("S1", at(1, 10, 0), 20.0)]).await;
        h.engine.process(&ds, &CancellationToken::new()).await.unwrap();

        let key = hour(at(1, 10, 0));
        let mut tampered = h.store.gold_row(&key).await.unwrap().unwrap();
        tampered.source_record_count = 7;
        h.store.commit_refresh(&tampered).await.unwrap();
        h.store
            .set_window_state(&WindowStatus {
                key: key.clone(),
                state: WindowState::Dirty,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let outcome = h.engine.refresh_window(&ds, &key, false).await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Inconsistent(_)));
        assert_eq!(h.events.named("aggregation_inconsistency").len(), 1);
        let status = h.store.window_status(&key).await.unwrap().unwrap();
        assert_eq!(status.state, WindowState::Dirty);
        let stored = h.store.gold_row(&key).await.unwrap().unwrap();
        assert_eq!(stored.source_record_count, 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_marking() {
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h.engine.process(&dataset(), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
    }
}
