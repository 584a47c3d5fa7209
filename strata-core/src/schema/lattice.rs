//! Field types, the type-widening lattice and field inference from parsed rows.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use crate::types::Payload;

/// Column data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Only nulls observed so far. Widens to anything.
    Null,
    Boolean,
    Integer,
    Float,
    Timestamp,
    String,
}

impl FieldType {
    /// Type of a single JSON value.
    pub fn of_value(value: &Value) -> FieldType {
        match value {
            Value::Null => FieldType::Null,
            Value::Bool(_) => FieldType::Boolean,
            Value::Number(n) => {
                if n.is_f64() {
                    FieldType::Float
                } else {
                    FieldType::Integer
                }
            }
            Value::String(s) => {
                if parse_timestamp(s, &[]).is_some() {
                    FieldType::Timestamp
                } else {
                    FieldType::String
                }
            }
            Value::Array(_) | Value::Object(_) => FieldType::String,
        }
    }

    /// Least type that holds values of both `self` and `other`.
    pub fn join(self, other: FieldType) -> FieldType {
        use FieldType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Null, t) | (t, Null) => t,
            (Integer, Float) | (Float, Integer) => Float,
            _ => String,
        }
    }

    /// Whether a column of type `self` already holds values of type `observed`
    /// without a schema change.
    pub fn accepts(self, observed: FieldType) -> bool {
        use FieldType::*;
        self == observed
            || observed == Null
            || self == String
            || (self == Float && observed == Integer)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Null => write!(f, "null"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Float => write!(f, "float"),
            FieldType::Timestamp => write!(f, "timestamp"),
            FieldType::String => write!(f, "string"),
        }
    }
}

/// Schema for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub nullable: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable,
        }
    }
}

/// A single allowed widening edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Widening {
    pub from: FieldType,
    pub to: FieldType,
}

/// Default widening edges: integers may become floats, timestamps may become
/// free-form strings.
pub fn default_widenings() -> Vec<Widening> {
    vec![
        Widening {
            from: FieldType::Integer,
            to: FieldType::Float,
        },
        Widening {
            from: FieldType::Timestamp,
            to: FieldType::String,
        },
    ]
}

/// Partial order of type widenings considered safe during schema evolution.
/// Reachability over the configured edges is transitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityLattice {
    edges: BTreeSet<(FieldType, FieldType)>,
}

impl Default for CompatibilityLattice {
    fn default() -> Self {
        Self::from_widenings(&default_widenings())
    }
}

impl CompatibilityLattice {
    pub fn from_widenings(widenings: &[Widening]) -> Self {
        Self {
            edges: widenings.iter().map(|w| (w.from, w.to)).collect(),
        }
    }

    /// Whether a column of type `from` may be republished as `to`.
    pub fn can_widen(&self, from: FieldType, to: FieldType) -> bool {
        if from == to || from == FieldType::Null {
            return true;
        }
        let mut seen = BTreeSet::from([from]);
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            for &(a, b) in &self.edges {
                if a != current || !seen.insert(b) {
                    continue;
                }
                if b == to {
                    return true;
                }
                queue.push_back(b);
            }
        }
        false
    }
}

const DATE_FORMAT: &str = "%Y-%m-%d";

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Parse a timestamp string. RFC 3339 first, then naive formats read as UTC.
/// `extra_formats` are tried before the built-in naive formats. A bare
/// `YYYY-MM-DD` date is midnight UTC.
pub fn parse_timestamp(s: &str, extra_formats: &[String]) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.len() < 10 || !s.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    extra_formats
        .iter()
        .map(String::as_str)
        .chain(TIMESTAMP_FORMATS.iter().copied())
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// Infer observed fields from parsed rows, in `columns` order.
///
/// A column missing from some rows, or holding nulls, is nullable.
pub fn infer_fields(columns: &[String], rows: &[Payload]) -> Vec<FieldDef> {
    columns
        .iter()
        .map(|name| {
            let mut field_type = FieldType::Null;
            let mut nullable = rows.is_empty();
            for row in rows {
                match row.get(name) {
                    None | Some(Value::Null) => nullable = true,
                    Some(v) => field_type = field_type.join(FieldType::of_value(v)),
                }
            }
            FieldDef {
                name: name.clone(),
                field_type,
                nullable,
            }
        })
        .collect()
}
