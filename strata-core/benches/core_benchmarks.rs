use std::collections::BTreeSet;

use chrono::{Duration, TimeZone, Utc};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;

use strata_core::aggregate::{compute_window, input_digest};
use strata_core::config::FileFormat;
use strata_core::ingest::parse_file;
use strata_core::quality::rules::{extract_key, normalize};
use strata_core::schema::infer_fields;
use strata_core::{CleanRecord, DatasetConfig, Granularity, WindowKey};

fn sensor_csv(rows: usize) -> String {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut out = String::from("sensor_id,timestamp,value,status\n");
    for i in 0..rows {
        let ts = start + Duration::seconds(i as i64 * 60);
        out.push_str(&format!(
            "TEMP_{:03},{},{:.2},normal\n",
            i % 10,
            ts.format("%Y-%m-%d %H:%M:%S"),
            20.0 + (i % 17) as f64 * 0.5
        ));
    }
    out
}

fn silver_rows(count: usize) -> Vec<CleanRecord> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    (0..count)
        .map(|i| {
            let event_time = start + Duration::seconds(i as i64);
            CleanRecord {
                seq: i as i64,
                dataset: "sensors".into(),
                entity_key: "TEMP_001".into(),
                event_time,
                fields: json!({ "sensor_id": "TEMP_001", "value": 20.0 + (i % 13) as f64 })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                flags: BTreeSet::new(),
                anomalies: Vec::new(),
                is_anomaly: i % 97 == 0,
                bronze_seq: i as i64,
                source_file: "sensors/day1.csv".into(),
                schema_version: 1,
                processed_at: event_time,
            }
        })
        .collect()
}

fn bench_parse(c: &mut Criterion) {
    let small = sensor_csv(100);
    let large = sensor_csv(10_000);

    c.bench_function("parse_csv_100_rows", |b| {
        b.iter(|| parse_file("sensors/a.csv", black_box(small.as_bytes()), FileFormat::Csv, ','))
    });

    c.bench_function("parse_csv_10k_rows", |b| {
        b.iter(|| parse_file("sensors/b.csv", black_box(large.as_bytes()), FileFormat::Csv, ','))
    });

    let parsed = parse_file("sensors/b.csv", large.as_bytes(), FileFormat::Csv, ',');
    if let Ok(parsed) = parsed {
        c.bench_function("infer_fields_10k_rows", |b| {
            b.iter(|| infer_fields(black_box(&parsed.columns), black_box(&parsed.rows)))
        });
    }
}

fn bench_quality_rules(c: &mut Criterion) {
    let dataset = DatasetConfig::new("sensors", "sensors/");
    let numeric = dataset.numeric_fields();
    let payload = json!({
        "sensor_id": " TEMP_001 ",
        "timestamp": "2024-01-01 10:00:00",
        "value": "21.5",
        "status": "normal",
    })
    .as_object()
    .cloned()
    .unwrap_or_default();

    c.bench_function("normalize_payload", |b| {
        b.iter(|| normalize(black_box(&payload), black_box(&numeric)))
    });

    c.bench_function("extract_record_key", |b| {
        b.iter(|| {
            extract_key(
                black_box(&payload),
                &dataset.entity_key,
                &dataset.timestamp_field,
                &dataset.timestamp_formats,
            )
        })
    });
}

fn bench_aggregation(c: &mut Criterion) {
    let dataset = DatasetConfig::new("sensors", "sensors/");
    let rows = silver_rows(3_600);
    let key = WindowKey::containing("sensors", "TEMP_001", Granularity::Hour, rows[0].event_time);
    let now = Utc::now();

    c.bench_function("compute_hour_window_3600_rows", |b| {
        b.iter(|| compute_window(black_box(&key), black_box(&rows), &dataset, now))
    });

    c.bench_function("input_digest_3600_rows", |b| {
        b.iter(|| input_digest(black_box(&rows), &dataset))
    });
}

criterion_group!(benches, bench_parse, bench_quality_rules, bench_aggregation);
criterion_main!(benches);
