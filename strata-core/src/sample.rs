//! Synthetic manufacturing data for demos and end-to-end tests.
//!
//! Writes one sensor CSV, one equipment log JSON file and one quality metrics
//! CSV per day into an [`ObjectStore`], laid out the way the sample datasets
//! expect them.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::f64::consts::PI;
use tracing::info;

use crate::error::Result;
use crate::store::ObjectStore;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const MINUTES_PER_DAY: u32 = 1440;

/// A simulated sensor and the equipment it is mounted on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorProfile {
    pub sensor_id: &'static str,
    pub equipment_id: &'static str,
    pub sensor_type: &'static str,
    pub location: &'static str,
    pub normal_range: (f64, f64),
    pub alert_range: (f64, f64),
    pub error_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EquipmentProfile {
    pub equipment_id: &'static str,
    pub name: &'static str,
    pub equipment_type: &'static str,
    pub location: &'static str,
}

pub const SENSORS: [SensorProfile; 5] = [
    SensorProfile {
        sensor_id: "TEMP_001",
        equipment_id: "EQ_FURNACE_01",
        sensor_type: "temperature",
        location: "Production Line A",
        normal_range: (20.0, 25.0),
        alert_range: (15.0, 35.0),
        error_rate: 0.02,
    },
    SensorProfile {
        sensor_id: "TEMP_002",
        equipment_id: "EQ_FURNACE_02",
        sensor_type: "temperature",
        location: "Production Line B",
        normal_range: (22.0, 28.0),
        alert_range: (18.0, 40.0),
        error_rate: 0.015,
    },
    SensorProfile {
        sensor_id: "HUM_001",
        equipment_id: "EQ_CHAMBER_01",
        sensor_type: "humidity",
        location: "Quality Control",
        normal_range: (45.0, 55.0),
        alert_range: (30.0, 70.0),
        error_rate: 0.01,
    },
    SensorProfile {
        sensor_id: "PRESS_001",
        equipment_id: "EQ_COMPRESSOR_01",
        sensor_type: "pressure",
        location: "Pneumatic System",
        normal_range: (100.0, 120.0),
        alert_range: (80.0, 150.0),
        error_rate: 0.025,
    },
    SensorProfile {
        sensor_id: "VIB_001",
        equipment_id: "EQ_MOTOR_01",
        sensor_type: "vibration",
        location: "Motor Assembly",
        normal_range: (0.1, 0.3),
        alert_range: (0.05, 0.8),
        error_rate: 0.03,
    },
];

pub const EQUIPMENT: [EquipmentProfile; 5] = [
    EquipmentProfile {
        equipment_id: "EQ_FURNACE_01",
        name: "Industrial Furnace Unit 1",
        equipment_type: "Heating Equipment",
        location: "Production Line A",
    },
    EquipmentProfile {
        equipment_id: "EQ_FURNACE_02",
        name: "Industrial Furnace Unit 2",
        equipment_type: "Heating Equipment",
        location: "Production Line B",
    },
    EquipmentProfile {
        equipment_id: "EQ_CHAMBER_01",
        name: "Environmental Chamber",
        equipment_type: "Climate Control",
        location: "Quality Control",
    },
    EquipmentProfile {
        equipment_id: "EQ_COMPRESSOR_01",
        name: "Air Compressor System",
        equipment_type: "Pneumatic Equipment",
        location: "Pneumatic System",
    },
    EquipmentProfile {
        equipment_id: "EQ_MOTOR_01",
        name: "Primary Drive Motor",
        equipment_type: "Motor Assembly",
        location: "Motor Assembly",
    },
];

const SENSOR_COLUMNS: [&str; 17] = [
    "sensor_id",
    "equipment_id",
    "timestamp",
    "value",
    "sensor_type",
    "location",
    "status",
    "quality_score",
    "is_anomaly",
    "temperature",
    "unit",
    "humidity",
    "pressure",
    "vibration_magnitude",
    "vibration_x",
    "vibration_y",
    "vibration_z",
];

const QUALITY_COLUMNS: [&str; 13] = [
    "equipment_id",
    "date",
    "location",
    "uptime_hours",
    "downtime_hours",
    "efficiency_percentage",
    "error_count",
    "warning_count",
    "maintenance_required",
    "last_maintenance_date",
    "next_maintenance_date",
    "production_units",
    "quality_score",
];

const LOG_LEVELS: [(&str, f64); 4] = [("INFO", 0.6), ("WARNING", 0.25), ("ERROR", 0.05), ("DEBUG", 0.1)];

fn log_messages(level: &str) -> &'static [&'static str] {
    match level {
        "WARNING" => &[
            "Temperature approaching upper threshold",
            "Vibration levels elevated but within limits",
            "Maintenance due within 24 hours",
            "Performance efficiency below optimal",
            "Sensor calibration recommended",
        ],
        "ERROR" => &[
            "Temperature exceeded safety threshold",
            "Unexpected shutdown detected",
            "Sensor malfunction detected",
            "Communication timeout with control system",
            "Safety interlock triggered",
        ],
        "DEBUG" => &[
            "Sensor reading validation completed",
            "Control loop iteration completed",
            "Memory usage check completed",
            "Network heartbeat successful",
            "Configuration parameter updated",
        ],
        _ => &[
            "Equipment startup completed successfully",
            "Maintenance cycle completed",
            "Performance metrics within normal range",
            "System health check passed",
            "Configuration updated successfully",
        ],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleOptions {
    pub start: NaiveDate,
    pub days: u32,
    /// Readings per sensor per day, spread evenly over the day.
    pub readings_per_day: u32,
    pub logs_per_equipment: u32,
    pub seed: u64,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            days: 7,
            readings_per_day: MINUTES_PER_DAY,
            logs_per_equipment: 100,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub files: Vec<String>,
    pub sensor_readings: u64,
    pub anomalies_injected: u64,
    pub equipment_logs: u64,
    pub quality_metrics: u64,
}

/// Deterministic generator: the same options always give the same bytes.
pub struct SampleGenerator {
    options: SampleOptions,
    rng: StdRng,
}

impl SampleGenerator {
    pub fn new(options: SampleOptions) -> Self {
        let rng = StdRng::seed_from_u64(options.seed);
        Self { options, rng }
    }

    pub fn options(&self) -> &SampleOptions {
        &self.options
    }

    pub fn sensor_key(date: NaiveDate) -> String {
        let day = date.format("%Y-%m-%d");
        format!("sensor_data/{day}/sensor_data_{day}.csv")
    }

    pub fn logs_key(date: NaiveDate) -> String {
        let day = date.format("%Y-%m-%d");
        format!("equipment_logs/{day}/equipment_logs_{day}.json")
    }

    pub fn quality_key(date: NaiveDate) -> String {
        let day = date.format("%Y-%m-%d");
        format!("quality_metrics/{day}/quality_metrics_{day}.csv")
    }

    /// Generate every day and write the files into `objects`.
    pub async fn write_to(&mut self, objects: &dyn ObjectStore) -> Result<SampleSummary> {
        let mut summary = SampleSummary::default();
        for offset in 0..self.options.days {
            let date = self.options.start + Duration::days(offset as i64);

            let (csv, readings, anomalies) = self.sensor_csv(date);
            let key = Self::sensor_key(date);
            objects.put(&key, csv.as_bytes()).await?;
            summary.files.push(key);
            summary.sensor_readings += readings;
            summary.anomalies_injected += anomalies;

            let logs = self.equipment_logs(date);
            let key = Self::logs_key(date);
            objects
                .put(&key, serde_json::to_string_pretty(&logs)?.as_bytes())
                .await?;
            summary.files.push(key);
            summary.equipment_logs += logs.len() as u64;

            let (csv, rows) = self.quality_metrics_csv(date);
            let key = Self::quality_key(date);
            objects.put(&key, csv.as_bytes()).await?;
            summary.files.push(key);
            summary.quality_metrics += rows;
        }
        info!(
            days = self.options.days,
            files = summary.files.len(),
            readings = summary.sensor_readings,
            logs = summary.equipment_logs,
            quality = summary.quality_metrics,
            "Generated sample data"
        );
        Ok(summary)
    }

    /// One day of sensor readings as CSV, with the reading and anomaly counts.
    pub fn sensor_csv(&mut self, date: NaiveDate) -> (String, u64, u64) {
        let per_day = self.options.readings_per_day.clamp(1, MINUTES_PER_DAY);
        let step = MINUTES_PER_DAY / per_day;
        let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();

        let mut out = SENSOR_COLUMNS.join(",");
        out.push('\n');
        let (mut readings, mut anomalies) = (0, 0);
        for minute in (0..MINUTES_PER_DAY).step_by(step as usize) {
            let ts = midnight + Duration::minutes(minute as i64);
            for sensor in &SENSORS {
                let cells = self.reading(sensor, ts);
                if cells[8] == "true" {
                    anomalies += 1;
                }
                out.push_str(&cells.join(","));
                out.push('\n');
                readings += 1;
            }
        }
        (out, readings, anomalies)
    }

    fn reading(&mut self, sensor: &SensorProfile, ts: NaiveDateTime) -> Vec<String> {
        let base = self.base_value(sensor, ts);
        let mut value = base + self.gaussian(0.1);
        let is_anomaly = self.rng.gen_bool(sensor.error_rate);
        if is_anomaly {
            let factor = [-2.0, -1.5, 1.5, 2.0].choose(&mut self.rng).copied().unwrap_or(2.0);
            value = base * factor;
        }
        let quality = self.quality_score(sensor, value);

        let mut cells = vec![String::new(); SENSOR_COLUMNS.len()];
        cells[0] = sensor.sensor_id.to_string();
        cells[1] = sensor.equipment_id.to_string();
        cells[2] = ts.format(TIMESTAMP_FORMAT).to_string();
        cells[3] = format!("{value:.3}");
        cells[4] = sensor.sensor_type.to_string();
        cells[5] = sensor.location.to_string();
        cells[6] = if is_anomaly { "error" } else { "normal" }.to_string();
        cells[7] = format!("{quality:.3}");
        cells[8] = is_anomaly.to_string();
        match sensor.sensor_type {
            "temperature" => {
                cells[9] = cells[3].clone();
                cells[10] = "celsius".into();
            }
            "humidity" => {
                cells[11] = cells[3].clone();
                cells[10] = "percent".into();
            }
            "pressure" => {
                cells[12] = cells[3].clone();
                cells[10] = "psi".into();
            }
            _ => {
                cells[13] = cells[3].clone();
                for idx in 14..17 {
                    cells[idx] = format!("{:.4}", value + self.gaussian(0.02));
                }
                cells[10] = "g".into();
            }
        }
        cells
    }

    /// Normal-range draw with day-shift heat, weekend damping and a
    /// seasonal swing for temperature sensors.
    fn base_value(&mut self, sensor: &SensorProfile, ts: NaiveDateTime) -> f64 {
        let (low, high) = sensor.normal_range;
        let mut value = self.rng.gen_range(low..=high);
        let is_temperature = sensor.sensor_type == "temperature";
        if is_temperature && (6..=18).contains(&ts.hour()) {
            value += self.rng.gen_range(1.0..=3.0);
        }
        if ts.weekday().number_from_monday() >= 6 {
            value *= 0.95;
        }
        if is_temperature {
            value += 2.0 * (2.0 * PI * ts.ordinal() as f64 / 365.0).sin();
        }
        value
    }

    fn quality_score(&mut self, sensor: &SensorProfile, value: f64) -> f64 {
        let in_range = |(low, high): (f64, f64)| low <= value && value <= high;
        if in_range(sensor.normal_range) {
            self.rng.gen_range(0.95..=1.0)
        } else if in_range(sensor.alert_range) {
            self.rng.gen_range(0.7..=0.9)
        } else {
            self.rng.gen_range(0.1..=0.6)
        }
    }

    /// One day of equipment log entries.
    pub fn equipment_logs(&mut self, date: NaiveDate) -> Vec<serde_json::Value> {
        let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        let mut logs = Vec::new();
        for equipment in &EQUIPMENT {
            for _ in 0..self.options.logs_per_equipment {
                let ts = midnight + Duration::seconds(self.rng.gen_range(0..86_400));
                logs.push(self.log_entry(equipment, ts));
            }
        }
        logs
    }

    fn log_entry(&mut self, equipment: &EquipmentProfile, ts: NaiveDateTime) -> serde_json::Value {
        let level = LOG_LEVELS
            .choose_weighted(&mut self.rng, |(_, weight)| *weight)
            .map(|(level, _)| *level)
            .unwrap_or("INFO");
        let message = log_messages(level)
            .choose(&mut self.rng)
            .copied()
            .unwrap_or_default();

        let mut entry = json!({
            "equipment_id": equipment.equipment_id,
            "equipment_name": equipment.name,
            "timestamp": ts.format(TIMESTAMP_FORMAT).to_string(),
            "log_level": level,
            "message": message,
            "location": equipment.location,
            "equipment_type": equipment.equipment_type,
            "status": "operational",
        });
        match level {
            "ERROR" => {
                entry["error_code"] = json!(format!("ERR_{}", self.rng.gen_range(1000..=9999)));
                entry["severity"] = json!(
                    ["LOW", "MEDIUM", "HIGH", "CRITICAL"]
                        .choose(&mut self.rng)
                        .copied()
                        .unwrap_or("LOW")
                );
            }
            "WARNING" => {
                entry["warning_code"] = json!(format!("WARN_{}", self.rng.gen_range(100..=999)));
            }
            _ => {}
        }
        entry["parameters"] = json!({
            "cpu_usage": round2(self.rng.gen_range(10.0..=90.0)),
            "memory_usage": round2(self.rng.gen_range(20.0..=80.0)),
            "network_latency": round2(self.rng.gen_range(1.0..=50.0)),
        });
        entry
    }

    /// One daily quality-control row per equipment as CSV, with the row count.
    pub fn quality_metrics_csv(&mut self, date: NaiveDate) -> (String, u64) {
        let mut out = QUALITY_COLUMNS.join(",");
        out.push('\n');
        for equipment in &EQUIPMENT {
            let last_maintenance = date - Duration::days(self.rng.gen_range(1..=30));
            let next_maintenance = date + Duration::days(self.rng.gen_range(1..=30));
            let cells = [
                equipment.equipment_id.to_string(),
                date.format("%Y-%m-%d").to_string(),
                equipment.location.to_string(),
                format!("{:.2}", self.rng.gen_range(20.0..=24.0)),
                format!("{:.2}", self.rng.gen_range(0.0..=4.0)),
                format!("{:.2}", self.rng.gen_range(85.0..=98.0)),
                self.rng.gen_range(0..=5u32).to_string(),
                self.rng.gen_range(0..=15u32).to_string(),
                self.rng.gen_bool(0.5).to_string(),
                last_maintenance.format("%Y-%m-%d").to_string(),
                next_maintenance.format("%Y-%m-%d").to_string(),
                self.rng.gen_range(800..=1200u32).to_string(),
                format!("{:.3}", self.rng.gen_range(0.9..=1.0)),
            ];
            out.push_str(&cells.join(","));
            out.push('\n');
        }
        (out, EQUIPMENT.len() as u64)
    }

    /// Box-Muller draw from N(0, std).
    fn gaussian(&mut self, std: f64) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.r#gen();
        std * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
