//! Pluggable anomaly policies.
//!
//! The built-in statistical policy scores each metric field of a reading
//! against a rolling window of the entity's earlier readings using a z-score
//! or interquartile-range test. The gap policy flags missing readings.

use std::sync::Arc;

use crate::config::{AnomalyConfig, DatasetConfig, DetectionMethod};
use crate::error::QualityError;
use crate::types::{Anomaly, CleanRecord};

/// What a policy sees for one candidate silver row.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyContext<'a> {
    pub dataset: &'a str,
    pub record: &'a CleanRecord,
    /// Earlier readings of the same entity by event time, oldest first.
    pub history: &'a [CleanRecord],
}

/// Decides whether a reading is anomalous. Anomalies annotate, never drop.
pub trait AnomalyPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, ctx: &AnomalyContext<'_>) -> Result<Vec<Anomaly>, QualityError>;
}

/// Result of scoring one value against its history.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub is_anomaly: bool,
    /// 0.0 (normal) to 1.0 (extreme).
    pub score: f64,
    pub expected: f64,
    pub expected_range: (f64, f64),
}

impl Detection {
    fn normal(value: f64) -> Self {
        Self {
            is_anomaly: false,
            score: 0.0,
            expected: value,
            expected_range: (value, value),
        }
    }
}

/// Statistical outlier test over a series of numbers.
#[derive(Debug, Clone)]
pub struct OutlierDetector {
    method: DetectionMethod,
    /// Z-score threshold or IQR multiplier, depending on `method`.
    threshold: f64,
}

impl OutlierDetector {
    pub fn zscore(threshold: f64) -> Self {
        Self {
            method: DetectionMethod::ZScore,
            threshold: threshold.max(0.1),
        }
    }

    pub fn iqr(multiplier: f64) -> Self {
        Self {
            method: DetectionMethod::Iqr,
            threshold: multiplier.max(0.1),
        }
    }

    pub fn from_config(config: &AnomalyConfig) -> Self {
        match config.method {
            DetectionMethod::ZScore => Self::zscore(config.zscore_threshold),
            DetectionMethod::Iqr => Self::iqr(config.iqr_multiplier),
        }
    }

    pub fn detect(&self, data: &[f64], value: f64) -> Detection {
        match self.method {
            DetectionMethod::ZScore => self.detect_zscore(data, value),
            DetectionMethod::Iqr => self.detect_iqr(data, value),
        }
    }

    fn detect_zscore(&self, data: &[f64], value: f64) -> Detection {
        if data.len() < 2 {
            return Detection::normal(value);
        }
        let mean = mean(data);
        let std_dev = std_deviation(data, mean);

        if std_dev < f64::EPSILON {
            let is_anomaly = (value - mean).abs() > f64::EPSILON;
            return Detection {
                is_anomaly,
                score: if is_anomaly { 1.0 } else { 0.0 },
                expected: mean,
                expected_range: (mean, mean),
            };
        }

        let z = (value - mean).abs() / std_dev;
        Detection {
            is_anomaly: z > self.threshold,
            score: (z / (self.threshold * 2.0)).min(1.0),
            expected: mean,
            expected_range: (
                mean - self.threshold * std_dev,
                mean + self.threshold * std_dev,
            ),
        }
    }

    fn detect_iqr(&self, data: &[f64], value: f64) -> Detection {
        if data.len() < 4 {
            return Detection::normal(value);
        }
        let mut sorted = data.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let q1 = percentile(&sorted, 25.0);
        let q3 = percentile(&sorted, 75.0);
        let iqr = q3 - q1;
        let lower = q1 - self.threshold * iqr;
        let upper = q3 + self.threshold * iqr;

        let is_anomaly = value < lower || value > upper;
        let distance = if value < lower {
            lower - value
        } else if value > upper {
            value - upper
        } else {
            0.0
        };
        let score = if iqr > f64::EPSILON {
            (distance / iqr).min(1.0)
        } else if is_anomaly {
            1.0
        } else {
            0.0
        };

        Detection {
            is_anomaly,
            score,
            expected: percentile(&sorted, 50.0),
            expected_range: (lower, upper),
        }
    }
}

fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Sample standard deviation given a precomputed mean.
fn std_deviation(data: &[f64], mean_val: f64) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let variance =
        data.iter().map(|x| (x - mean_val).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

/// Percentile of sorted data using linear interpolation.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

/// Outlier test per metric field against the entity's rolling history.
#[derive(Debug, Clone)]
pub struct StatisticalRangePolicy {
    fields: Vec<String>,
    detector: OutlierDetector,
    window: usize,
    min_history: usize,
}

impl StatisticalRangePolicy {
    pub fn new(fields: Vec<String>, detector: OutlierDetector, window: usize, min_history: usize) -> Self {
        Self {
            fields,
            detector,
            window: window.max(1),
            min_history: min_history.max(2),
        }
    }
}

impl AnomalyPolicy for StatisticalRangePolicy {
    fn name(&self) -> &str {
        "statistical_range"
    }

    fn evaluate(&self, ctx: &AnomalyContext<'_>) -> Result<Vec<Anomaly>, QualityError> {
        let tail_start = ctx.history.len().saturating_sub(self.window);
        let tail = &ctx.history[tail_start..];
        let mut found = Vec::new();
        for field in &self.fields {
            let Some(value) = ctx.record.numeric(field) else {
                continue;
            };
            if !value.is_finite() {
                return Err(QualityError::Policy {
                    policy: self.name().to_string(),
                    message: format!("non-finite value in '{field}'"),
                });
            }
            let series: Vec<f64> = tail.iter().filter_map(|r| r.numeric(field)).collect();
            if series.len() < self.min_history {
                continue;
            }
            let detection = self.detector.detect(&series, value);
            if detection.is_anomaly {
                found.push(Anomaly::StatisticalOutlier {
                    field: field.clone(),
                    value,
                    score: detection.score,
                    expected_low: detection.expected_range.0,
                    expected_high: detection.expected_range.1,
                });
            }
        }
        Ok(found)
    }
}

/// Flags a reading that follows the previous one after too long a gap.
#[derive(Debug, Clone, Copy)]
pub struct ReadingGapPolicy {
    max_gap_secs: i64,
}

impl ReadingGapPolicy {
    pub fn new(max_gap_secs: i64) -> Self {
        Self { max_gap_secs }
    }
}

impl AnomalyPolicy for ReadingGapPolicy {
    fn name(&self) -> &str {
        "reading_gap"
    }

    fn evaluate(&self, ctx: &AnomalyContext<'_>) -> Result<Vec<Anomaly>, QualityError> {
        let Some(previous) = ctx.history.last() else {
            return Ok(Vec::new());
        };
        let gap_secs = (ctx.record.event_time - previous.event_time).num_seconds();
        if gap_secs > self.max_gap_secs {
            Ok(vec![Anomaly::ReadingGap { gap_secs }])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Runs several policies and concatenates their findings.
#[derive(Default, Clone)]
pub struct CompositePolicy {
    policies: Vec<Arc<dyn AnomalyPolicy>>,
}

impl CompositePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, policy: Arc<dyn AnomalyPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    /// Built-in policies for a dataset.
    pub fn for_dataset(dataset: &DatasetConfig) -> Self {
        let config = &dataset.anomaly;
        let mut composite = Self::new();
        if !config.enabled {
            return composite;
        }
        if !dataset.metric_fields.is_empty() {
            composite = composite.with(Arc::new(StatisticalRangePolicy::new(
                dataset.metric_fields.clone(),
                OutlierDetector::from_config(config),
                config.history_window,
                config.min_history,
            )));
        }
        if let Some(max_gap) = config.max_gap_secs {
            composite = composite.with(Arc::new(ReadingGapPolicy::new(max_gap)));
        }
        composite
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl AnomalyPolicy for CompositePolicy {
    fn name(&self) -> &str {
        "composite"
    }

    fn evaluate(&self, ctx: &AnomalyContext<'_>) -> Result<Vec<Anomaly>, QualityError> {
        let mut found = Vec::new();
        for policy in &self.policies {
            found.extend(policy.evaluate(ctx)?);
        }
        Ok(found)
    }
}
