//! Property-based tests for core components using proptest.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;

use strata_core::aggregate::compute_window;
use strata_core::orchestrator::{RetryMachine, RetryPolicy, RetryState};
use strata_core::schema::{
    CompatibilityLattice, Evaluation, FieldDef, FieldType, SchemaVersion, evaluate,
};
use strata_core::{CleanRecord, DatasetConfig, Granularity, WindowKey};

fn field_type() -> impl Strategy<Value = FieldType> {
    prop_oneof![
        Just(FieldType::Null),
        Just(FieldType::Boolean),
        Just(FieldType::Integer),
        Just(FieldType::Float),
        Just(FieldType::Timestamp),
        Just(FieldType::String),
    ]
}

fn observed_shape() -> impl Strategy<Value = Vec<FieldDef>> {
    prop::collection::btree_map(
        prop::sample::select(vec!["a", "b", "c", "d", "e"]),
        (field_type(), any::<bool>()),
        1..5,
    )
    .prop_map(|fields| {
        fields
            .into_iter()
            .map(|(name, (t, nullable))| FieldDef::new(name, t, nullable))
            .collect()
    })
}

fn record(seq: i64, minute: u32, value: f64, anomaly: bool) -> CleanRecord {
    let event_time = Utc.with_ymd_and_hms(2024, 1, 1, 10, minute, 0).unwrap();
    let fields = json!({ "sensor_id": "S1", "value": value })
        .as_object()
        .cloned()
        .unwrap();
    CleanRecord {
        seq,
        dataset: "sensors".into(),
        entity_key: "S1".into(),
        event_time,
        fields,
        flags: BTreeSet::new(),
        anomalies: Vec::new(),
        is_anomaly: anomaly,
        bronze_seq: seq,
        source_file: "sensors/a.csv".into(),
        schema_version: 1,
        processed_at: event_time,
    }
}

// --- Schema evolution properties ---

proptest! {
    #[test]
    fn accepted_versions_never_drop_fields(shapes in prop::collection::vec(observed_shape(), 1..12)) {
        let lattice = CompatibilityLattice::default();
        let mut current: Option<SchemaVersion> = None;
        for shape in &shapes {
            match evaluate(current.as_ref(), shape, &lattice) {
                Evaluation::Unchanged | Evaluation::Incompatible(_) => {}
                Evaluation::Evolve { fields, changes } => {
                    prop_assert!(!changes.is_empty());
                    if let Some(prev) = &current {
                        for old in &prev.fields {
                            let new = fields.iter().find(|f| f.name == old.name);
                            prop_assert!(new.is_some(), "field {} disappeared", old.name);
                            let new = new.unwrap();
                            prop_assert!(!old.nullable || new.nullable);
                            prop_assert!(lattice.can_widen(old.field_type, new.field_type));
                        }
                    }
                    let version = current.as_ref().map(|v| v.version + 1).unwrap_or(1);
                    current = Some(SchemaVersion {
                        dataset: "ds".into(),
                        version,
                        fields,
                        parent_version: version.checked_sub(1).filter(|v| *v > 0),
                        changes,
                        created_at: Utc::now(),
                    });
                }
            }
        }
    }

    #[test]
    fn reproposing_the_current_shape_is_unchanged(shape in observed_shape()) {
        let lattice = CompatibilityLattice::default();
        let Evaluation::Evolve { fields, changes } = evaluate(None, &shape, &lattice) else {
            return Err(TestCaseError::fail("first shape must create a version"));
        };
        let v1 = SchemaVersion {
            dataset: "ds".into(),
            version: 1,
            fields,
            parent_version: None,
            changes,
            created_at: Utc::now(),
        };
        prop_assert_eq!(evaluate(Some(&v1), &shape, &lattice), Evaluation::Unchanged);
    }
}

// --- Aggregation properties ---

proptest! {
    #[test]
    fn recomputing_a_window_gives_the_same_values(
        readings in prop::collection::vec((0u32..60, -1000.0f64..1000.0, any::<bool>()), 0..40)
    ) {
        let dataset = DatasetConfig::new("sensors", "sensors/");
        let rows: Vec<CleanRecord> = readings
            .iter()
            .enumerate()
            .map(|(i, (minute, value, anomaly))| record(i as i64, *minute, *value, *anomaly))
            .collect();
        let key = WindowKey::containing(
            "sensors",
            "S1",
            Granularity::Hour,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
        );

        let first = compute_window(&key, &rows, &dataset, Utc::now());
        let second = compute_window(&key, &rows, &dataset, Utc::now() + chrono::Duration::hours(1));
        prop_assert!(first.same_values(&second));
        prop_assert_eq!(first.source_record_count, rows.len() as u64);
        prop_assert_eq!(
            first.anomaly_count,
            readings.iter().filter(|(_, _, a)| *a).count() as u64
        );

        match first.metrics.get("value") {
            None => prop_assert!(rows.is_empty()),
            Some(summary) => {
                prop_assert_eq!(summary.count, rows.len() as u64);
                prop_assert!(summary.min <= summary.max);
                prop_assert!(summary.mean >= summary.min - 1e-6);
                prop_assert!(summary.mean <= summary.max + 1e-6);
            }
        }
    }

    #[test]
    fn resequenced_rows_digest_the_same(
        values in prop::collection::vec(-100.0f64..100.0, 1..20),
        offset in 1i64..10_000,
    ) {
        let dataset = DatasetConfig::new("sensors", "sensors/");
        let rows: Vec<CleanRecord> = values
            .iter()
            .enumerate()
            .map(|(i, v)| record(i as i64, i as u32, *v, false))
            .collect();
        let shifted: Vec<CleanRecord> = rows
            .iter()
            .cloned()
            .map(|mut r| {
                r.seq += offset;
                r.bronze_seq += offset;
                r
            })
            .collect();
        let key = WindowKey::containing("sensors", "S1", Granularity::Hour, rows[0].event_time);
        let now = Utc::now();
        let a = compute_window(&key, &rows, &dataset, now);
        let b = compute_window(&key, &shifted, &dataset, now);
        prop_assert_eq!(a.input_digest, b.input_digest);
    }
}

// --- Retry properties ---

proptest! {
    #[test]
    fn backoff_never_exceeds_the_cap(
        base_ms in 1u64..5_000,
        max_ms in 1u64..60_000,
        attempt in 1u32..64,
        jitter in any::<bool>(),
        seed in any::<u64>(),
    ) {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter,
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let delay = policy.delay_for(attempt, &mut rng);
        prop_assert!(delay <= policy.max_delay);
    }

    #[test]
    fn transient_failures_stop_after_max_retries(max_retries in 0u32..8, seed in any::<u64>()) {
        let policy = RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: true,
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let mut machine = RetryMachine::new(policy);
        let mut attempts = 0;
        loop {
            attempts += 1;
            prop_assert!(attempts <= max_retries + 1);
            match machine.fail(true, &mut rng) {
                RetryState::Backoff { .. } => {
                    machine.resume();
                }
                RetryState::Exhausted { attempts: total } => {
                    prop_assert_eq!(total, max_retries + 1);
                    break;
                }
                other => return Err(TestCaseError::fail(format!("unexpected state {other:?}"))),
            }
        }
        prop_assert_eq!(attempts, max_retries + 1);
    }
}
