//! Configuration system for Strata.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace `strata.toml` (or an explicit file) -> environment -> overrides.
//! The user-level file lives at `~/.config/strata/strata.toml`.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::schema::{CompatibilityLattice, Widening, default_widenings};
use crate::types::Granularity;

/// Name of the workspace-level configuration file.
pub const CONFIG_FILE: &str = "strata.toml";

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    /// Size of the worker pool for file ingestion and `run_all`.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub datasets: Vec<DatasetConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            workers: default_workers(),
            retry: RetryConfig::default(),
            schedule: ScheduleConfig::default(),
            datasets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the local object store.
    #[serde(default = "default_object_root")]
    pub object_root: PathBuf,
    /// SQLite database holding every tier, the ledger and checkpoints.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Optional JSON-lines file receiving pipeline events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_log: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            object_root: default_object_root(),
            database: default_database(),
            events_log: None,
        }
    }
}

/// Retry policy for transient stage failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between runs in `watch` mode.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

/// Source file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Csv,
    Json,
    Jsonl,
}

impl FileFormat {
    /// Format implied by a file extension.
    pub fn from_key(key: &str) -> Option<FileFormat> {
        let ext = key.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(FileFormat::Csv),
            "json" => Some(FileFormat::Json),
            "jsonl" | "ndjson" => Some(FileFormat::Jsonl),
            _ => None,
        }
    }
}

/// Inclusive numeric bounds for a field. Either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RangeRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl RangeRule {
    pub fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// Statistical detection method for the outlier policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    ZScore,
    Iqr,
}

/// Anomaly policy thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_method")]
    pub method: DetectionMethod,
    /// Z-score above which a value is an outlier.
    #[serde(default = "default_zscore_threshold")]
    pub zscore_threshold: f64,
    #[serde(default = "default_iqr_multiplier")]
    pub iqr_multiplier: f64,
    /// Readings per entity kept as rolling history.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Readings required before the outlier policy fires.
    #[serde(default = "default_min_history")]
    pub min_history: usize,
    /// Gap between consecutive readings of an entity that counts as missing data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gap_secs: Option<i64>,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: default_method(),
            zscore_threshold: default_zscore_threshold(),
            iqr_multiplier: default_iqr_multiplier(),
            history_window: default_history_window(),
            min_history: default_min_history(),
            max_gap_secs: Some(300),
        }
    }
}

/// Per-dataset configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    /// Object key prefix the dataset's files land under.
    pub source_prefix: String,
    /// Forces a format regardless of file extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FileFormat>,
    #[serde(default = "default_delimiter")]
    pub csv_delimiter: char,
    #[serde(default = "default_entity_key")]
    pub entity_key: String,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    /// Extra `chrono` formats tried for naive timestamps (read as UTC).
    #[serde(default = "default_timestamp_formats")]
    pub timestamp_formats: Vec<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub ranges: BTreeMap<String, RangeRule>,
    /// Numeric fields summarised in gold.
    #[serde(default = "default_metric_fields")]
    pub metric_fields: Vec<String>,
    /// Allowed type widenings.
    #[serde(default = "default_widenings")]
    pub widenings: Vec<Widening>,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default = "default_lateness_horizon_hours")]
    pub lateness_horizon_hours: u64,
    /// A file whose share of bad rows exceeds this fails in full.
    #[serde(default = "default_max_row_error_rate")]
    pub max_row_error_rate: f64,
    #[serde(default = "default_granularities")]
    pub granularities: Vec<Granularity>,
    #[serde(default = "default_quality_batch_size")]
    pub quality_batch_size: usize,
    /// Include OutOfRange values in metric statistics.
    #[serde(default)]
    pub aggregate_flagged: bool,
}

impl DatasetConfig {
    /// A dataset with defaults for everything but its name and prefix.
    pub fn new(name: impl Into<String>, source_prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_prefix: source_prefix.into(),
            format: None,
            csv_delimiter: default_delimiter(),
            entity_key: default_entity_key(),
            timestamp_field: default_timestamp_field(),
            timestamp_formats: default_timestamp_formats(),
            required_fields: Vec::new(),
            ranges: BTreeMap::new(),
            metric_fields: default_metric_fields(),
            widenings: default_widenings(),
            anomaly: AnomalyConfig::default(),
            lateness_horizon_hours: default_lateness_horizon_hours(),
            max_row_error_rate: default_max_row_error_rate(),
            granularities: default_granularities(),
            quality_batch_size: default_quality_batch_size(),
            aggregate_flagged: false,
        }
    }

    pub fn lattice(&self) -> CompatibilityLattice {
        CompatibilityLattice::from_widenings(&self.widenings)
    }

    /// Format of an object, honouring the configured override.
    pub fn format_of(&self, key: &str) -> Option<FileFormat> {
        self.format.or_else(|| FileFormat::from_key(key))
    }

    /// Fields whose numeric strings are converted to numbers.
    pub fn numeric_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.metric_fields.clone();
        for name in self.ranges.keys() {
            if !fields.contains(name) {
                fields.push(name.clone());
            }
        }
        fields
    }

    /// Soft warnings; hard errors are returned as `Err`.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "datasets[].name".into(),
            });
        }
        if self.entity_key.trim().is_empty() || self.timestamp_field.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: format!(
                    "dataset '{}' needs both entity_key and timestamp_field",
                    self.name
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.max_row_error_rate) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "dataset '{}': max_row_error_rate must be within [0, 1], got {}",
                    self.name, self.max_row_error_rate
                ),
            });
        }
        if self.quality_batch_size == 0 {
            return Err(ConfigError::Invalid {
                message: format!("dataset '{}': quality_batch_size must be > 0", self.name),
            });
        }
        if self.granularities.is_empty() {
            return Err(ConfigError::Invalid {
                message: format!("dataset '{}' has no aggregation granularities", self.name),
            });
        }
        for (field, rule) in &self.ranges {
            if let (Some(min), Some(max)) = (rule.min, rule.max) {
                if min > max {
                    return Err(ConfigError::Invalid {
                        message: format!(
                            "dataset '{}': range for '{field}' has min {min} > max {max}",
                            self.name
                        ),
                    });
                }
            }
        }
        if self.source_prefix.is_empty() {
            warnings.push(format!(
                "dataset '{}' has an empty source_prefix and will scan the whole object store",
                self.name
            ));
        }
        if self.metric_fields.is_empty() {
            warnings.push(format!(
                "dataset '{}' has no metric_fields; gold rows will only carry counts",
                self.name
            ));
        }
        if self.anomaly.enabled && self.anomaly.min_history > self.anomaly.history_window {
            warnings.push(format!(
                "dataset '{}': anomaly.min_history exceeds history_window, outlier detection never fires",
                self.name
            ));
        }
        Ok(warnings)
    }
}

impl PipelineConfig {
    pub fn dataset(&self, name: &str) -> Result<&DatasetConfig, ConfigError> {
        self.datasets
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ConfigError::UnknownDataset {
                name: name.to_string(),
            })
    }

    /// Hard errors as `Err`, soft warnings as strings.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                message: "workers must be at least 1".into(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid {
                message: format!(
                    "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                    self.retry.base_delay_ms, self.retry.max_delay_ms
                ),
            });
        }
        let mut seen = HashSet::new();
        for dataset in &self.datasets {
            if !seen.insert(dataset.name.as_str()) {
                return Err(ConfigError::DuplicateDataset {
                    name: dataset.name.clone(),
                });
            }
            warnings.extend(dataset.validate()?);
        }
        if self.datasets.is_empty() {
            warnings.push("no datasets configured".into());
        }
        if self.schedule.interval_secs == 0 {
            warnings.push("schedule.interval_secs is 0; watch mode will run back to back".into());
        }
        Ok(warnings)
    }

    /// Starter configuration describing the sample manufacturing datasets.
    pub fn sample() -> Self {
        let mut sensors = DatasetConfig::new("sensor_data", "sensor_data/");
        sensors.format = Some(FileFormat::Csv);
        sensors.required_fields = vec!["sensor_id".into(), "timestamp".into(), "value".into()];
        sensors.metric_fields = vec!["value".into(), "quality_score".into()];
        sensors.ranges.insert(
            "quality_score".into(),
            RangeRule {
                min: Some(0.0),
                max: Some(1.0),
            },
        );
        sensors.ranges.insert(
            "temperature".into(),
            RangeRule {
                min: Some(-40.0),
                max: Some(150.0),
            },
        );
        sensors.ranges.insert(
            "humidity".into(),
            RangeRule {
                min: Some(0.0),
                max: Some(100.0),
            },
        );

        let mut logs = DatasetConfig::new("equipment_logs", "equipment_logs/");
        logs.format = Some(FileFormat::Json);
        logs.entity_key = "equipment_id".into();
        logs.required_fields = vec!["equipment_id".into(), "timestamp".into(), "log_level".into()];
        logs.metric_fields = vec![
            "parameters.cpu_usage".into(),
            "parameters.memory_usage".into(),
            "parameters.network_latency".into(),
        ];
        logs.ranges.insert(
            "parameters.cpu_usage".into(),
            RangeRule {
                min: Some(0.0),
                max: Some(100.0),
            },
        );
        logs.anomaly.max_gap_secs = None;

        let mut quality = DatasetConfig::new("quality_metrics", "quality_metrics/");
        quality.format = Some(FileFormat::Csv);
        quality.entity_key = "equipment_id".into();
        quality.timestamp_field = "date".into();
        quality.required_fields = vec!["equipment_id".into(), "date".into()];
        quality.metric_fields = vec![
            "uptime_hours".into(),
            "downtime_hours".into(),
            "efficiency_percentage".into(),
            "production_units".into(),
            "quality_score".into(),
        ];
        for (field, max) in [
            ("uptime_hours", 24.0),
            ("downtime_hours", 24.0),
            ("efficiency_percentage", 100.0),
            ("quality_score", 1.0),
        ] {
            quality.ranges.insert(
                field.into(),
                RangeRule {
                    min: Some(0.0),
                    max: Some(max),
                },
            );
        }
        quality.anomaly.max_gap_secs = None;

        Self {
            datasets: vec![sensors, logs, quality],
            ..Self::default()
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_object_root() -> PathBuf {
    PathBuf::from("data/landing")
}

fn default_database() -> PathBuf {
    PathBuf::from("data/strata.db")
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    300
}

fn default_delimiter() -> char {
    ','
}

fn default_entity_key() -> String {
    "sensor_id".into()
}

fn default_timestamp_field() -> String {
    "timestamp".into()
}

fn default_timestamp_formats() -> Vec<String> {
    vec!["%Y-%m-%d %H:%M:%S".into()]
}

fn default_metric_fields() -> Vec<String> {
    vec!["value".into()]
}

fn default_method() -> DetectionMethod {
    DetectionMethod::ZScore
}

fn default_zscore_threshold() -> f64 {
    3.0
}

fn default_iqr_multiplier() -> f64 {
    1.5
}

fn default_history_window() -> usize {
    30
}

fn default_min_history() -> usize {
    5
}

fn default_lateness_horizon_hours() -> u64 {
    48
}

fn default_max_row_error_rate() -> f64 {
    0.05
}

fn default_granularities() -> Vec<Granularity> {
    vec![Granularity::Hour, Granularity::Day]
}

fn default_quality_batch_size() -> usize {
    10_000
}

/// User-level config file, if the platform has a config directory.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "strata", "strata")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Load configuration from all layers.
///
/// `workspace` is searched for `strata.toml`; `explicit` replaces that file
/// and must exist.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
    overrides: Option<&PipelineConfig>,
) -> Result<PipelineConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    // User-level config
    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Explicit file, or the workspace-level one
    match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            if let Some(ws) = workspace {
                let ws_config = ws.join(CONFIG_FILE);
                if ws_config.exists() {
                    figment = figment.merge(Toml::file(&ws_config));
                }
            }
        }
    }

    // Environment variables (STRATA_WORKERS, STRATA_RETRY__MAX_RETRIES, etc.)
    figment = figment.merge(Env::prefixed("STRATA_").split("__"));

    // Explicit overrides
    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}

/// Serialise a configuration to TOML.
pub fn to_toml(config: &PipelineConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(config).map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}

/// Write `strata.toml` into `dir`. Refuses to overwrite unless `force`.
pub fn write_starter_config(
    dir: &Path,
    config: &PipelineConfig,
    force: bool,
) -> Result<PathBuf, ConfigError> {
    let path = dir.join(CONFIG_FILE);
    if path.exists() && !force {
        return Err(ConfigError::Invalid {
            message: format!("{} already exists", path.display()),
        });
    }
    let body = to_toml(config)?;
    std::fs::create_dir_all(dir).map_err(|e| ConfigError::Invalid {
        message: e.to_string(),
    })?;
    std::fs::write(&path, body).map_err(|e| ConfigError::Invalid {
        message: e.to_string(),
    })?;
    Ok(path)
}
