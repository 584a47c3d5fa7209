//! Row-level validation rules.

use chrono::{DateTime, Utc};
use serde_json::{Number, Value};
use std::collections::BTreeMap;

use crate::config::RangeRule;
use crate::schema::parse_timestamp;
use crate::types::{Payload, RecordKey};

/// Epoch values above this are read as milliseconds.
const EPOCH_MILLIS_CUTOFF: f64 = 1e11;

/// Entity key as a string. Numbers are accepted, blanks are not.
pub fn entity_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Event time from a timestamp string or an epoch number (seconds or millis).
pub fn event_time_of(value: Option<&Value>, formats: &[String]) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => parse_timestamp(s.trim(), formats),
        Value::Number(n) => {
            let raw = n.as_f64()?;
            if !raw.is_finite() {
                return None;
            }
            if raw.abs() >= EPOCH_MILLIS_CUTOFF {
                DateTime::from_timestamp_millis(raw as i64)
            } else {
                DateTime::from_timestamp_millis((raw * 1000.0).round() as i64)
            }
        }
        _ => None,
    }
}

/// Dedup key of a row, if both parts are usable.
pub fn extract_key(
    payload: &Payload,
    entity_field: &str,
    timestamp_field: &str,
    formats: &[String],
) -> Option<RecordKey> {
    Some(RecordKey {
        entity_key: entity_of(payload.get(entity_field))?,
        event_time: event_time_of(payload.get(timestamp_field), formats)?,
    })
}

/// Convert numeric strings in `numeric_fields` to numbers.
pub fn normalize(payload: &Payload, numeric_fields: &[String]) -> Payload {
    let mut out = payload.clone();
    for field in numeric_fields {
        let Some(Value::String(raw)) = out.get(field) else {
            continue;
        };
        let trimmed = raw.trim();
        let parsed = if let Ok(i) = trimmed.parse::<i64>() {
            Some(Value::from(i))
        } else {
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
        };
        if let Some(number) = parsed {
            out.insert(field.clone(), number);
        }
    }
    out
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Required fields that are absent, null or blank.
pub fn missing_required<'a>(payload: &Payload, required: &'a [String]) -> Vec<&'a str> {
    required
        .iter()
        .filter(|field| is_blank(payload.get(field.as_str())))
        .map(String::as_str)
        .collect()
}

/// Fields whose numeric value falls outside their range. Non-numeric and
/// absent values are not range-checked.
pub fn out_of_range<'a>(payload: &Payload, ranges: &'a BTreeMap<String, RangeRule>) -> Vec<&'a str> {
    ranges
        .iter()
        .filter(|(field, rule)| {
            payload
                .get(field.as_str())
                .and_then(Value::as_f64)
                .is_some_and(|v| !rule.contains(v))
        })
        .map(|(field, _)| field.as_str())
        .collect()
}
