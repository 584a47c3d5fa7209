//! Append-only schema log per dataset with compare-and-set publishing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::lattice::{CompatibilityLattice, FieldDef, FieldType};
use crate::error::{Result, SchemaError, StoreError};
use crate::store::TableStore;
use crate::types::Payload;

/// How many lost publish races a proposal tolerates before giving up.
const MAX_PUBLISH_ATTEMPTS: usize = 5;

/// One change between consecutive schema versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum SchemaChange {
    FieldAdded {
        field: String,
        field_type: FieldType,
    },
    TypeWidened {
        field: String,
        from: FieldType,
        to: FieldType,
    },
    NullabilityRelaxed {
        field: String,
    },
}

impl std::fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaChange::FieldAdded { field, field_type } => write!(f, "+{field}: {field_type}"),
            SchemaChange::TypeWidened { field, from, to } => write!(f, "{field}: {from} -> {to}"),
            SchemaChange::NullabilityRelaxed { field } => write!(f, "{field}: nullable"),
        }
    }
}

/// An immutable published schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub dataset: String,
    pub version: u32,
    pub fields: Vec<FieldDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version: Option<u32>,
    #[serde(default)]
    pub changes: Vec<SchemaChange>,
    pub created_at: DateTime<Utc>,
}

impl SchemaVersion {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Check a payload against this version.
    ///
    /// Absent fields read as null. Fields unknown to the schema are an error.
    pub fn conforms(&self, payload: &Payload) -> std::result::Result<(), String> {
        if let Some(unknown) = payload.keys().find(|k| self.field(k).is_none()) {
            return Err(format!("unknown field '{unknown}'"));
        }
        for field in &self.fields {
            match payload.get(&field.name) {
                None => {}
                Some(Value::Null) if !field.nullable => {
                    return Err(format!("field '{}' is not nullable", field.name));
                }
                Some(value) => {
                    let observed = FieldType::of_value(value);
                    if !field.field_type.accepts(observed) {
                        return Err(format!(
                            "field '{}' is {}, got {observed}",
                            field.name, field.field_type
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Rewrite a payload into this version's field order, filling absent
    /// fields with null and dropping unknown ones.
    pub fn project(&self, payload: &Payload) -> Payload {
        self.fields
            .iter()
            .map(|f| {
                (
                    f.name.clone(),
                    payload.get(&f.name).cloned().unwrap_or(Value::Null),
                )
            })
            .collect()
    }
}

/// Result of evaluating an observed shape against the current schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Unchanged,
    Evolve {
        fields: Vec<FieldDef>,
        changes: Vec<SchemaChange>,
    },
    Incompatible(String),
}

/// Decide how `observed` relates to `current`. Pure; no I/O.
pub fn evaluate(
    current: Option<&SchemaVersion>,
    observed: &[FieldDef],
    lattice: &CompatibilityLattice,
) -> Evaluation {
    if observed.is_empty() && current.is_none() {
        return Evaluation::Incompatible("no fields observed".to_string());
    }
    let Some(current) = current else {
        let changes = observed
            .iter()
            .map(|f| SchemaChange::FieldAdded {
                field: f.name.clone(),
                field_type: f.field_type,
            })
            .collect();
        return Evaluation::Evolve {
            fields: observed.to_vec(),
            changes,
        };
    };

    let mut fields = current.fields.clone();
    let mut changes = Vec::new();
    for obs in observed {
        match fields.iter().position(|f| f.name == obs.name) {
            Some(idx) => {
                let existing = &mut fields[idx];
                if !existing.field_type.accepts(obs.field_type) {
                    if !lattice.can_widen(existing.field_type, obs.field_type) {
                        return Evaluation::Incompatible(format!(
                            "field '{}' is {}, observed {} with no widening path",
                            obs.name, existing.field_type, obs.field_type
                        ));
                    }
                    changes.push(SchemaChange::TypeWidened {
                        field: obs.name.clone(),
                        from: existing.field_type,
                        to: obs.field_type,
                    });
                    existing.field_type = obs.field_type;
                }
                if obs.nullable && !existing.nullable {
                    changes.push(SchemaChange::NullabilityRelaxed {
                        field: obs.name.clone(),
                    });
                    existing.nullable = true;
                }
            }
            None => {
                changes.push(SchemaChange::FieldAdded {
                    field: obs.name.clone(),
                    field_type: obs.field_type,
                });
                fields.push(FieldDef {
                    name: obs.name.clone(),
                    field_type: obs.field_type,
                    nullable: true,
                });
            }
        }
    }

    if changes.is_empty() {
        Evaluation::Unchanged
    } else {
        Evaluation::Evolve { fields, changes }
    }
}

/// Outcome of [`SchemaRegistry::propose_schema`].
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaDecision {
    /// The current version already accepts the observed shape.
    Accepted(Arc<SchemaVersion>),
    /// A new version was published.
    EvolutionRequired {
        version: Arc<SchemaVersion>,
        diff: Vec<SchemaChange>,
    },
    Incompatible { reason: String },
}

/// Owns the accepted shape of every dataset.
pub struct SchemaRegistry {
    store: Arc<dyn TableStore>,
    lattices: HashMap<String, CompatibilityLattice>,
    default_lattice: CompatibilityLattice,
    cache: RwLock<HashMap<String, Arc<SchemaVersion>>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SchemaRegistry {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self {
            store,
            lattices: HashMap::new(),
            default_lattice: CompatibilityLattice::default(),
            cache: RwLock::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Use a dataset-specific lattice instead of the default one.
    pub fn with_lattice(mut self, dataset: impl Into<String>, lattice: CompatibilityLattice) -> Self {
        self.lattices.insert(dataset.into(), lattice);
        self
    }

    fn lattice(&self, dataset: &str) -> &CompatibilityLattice {
        self.lattices.get(dataset).unwrap_or(&self.default_lattice)
    }

    fn dataset_lock(&self, dataset: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(dataset.to_string()).or_default())
    }

    /// Current version, or `None` before the first file.
    pub async fn current(&self, dataset: &str) -> Result<Option<Arc<SchemaVersion>>> {
        if let Some(v) = self.cache.read().await.get(dataset) {
            return Ok(Some(Arc::clone(v)));
        }
        self.reload(dataset).await
    }

    /// Full version history, oldest first.
    pub async fn versions(&self, dataset: &str) -> Result<Vec<SchemaVersion>> {
        let versions = self.store.schema_versions(dataset).await?;
        check_contiguous(dataset, &versions)?;
        Ok(versions)
    }

    pub async fn version(&self, dataset: &str, version: u32) -> Result<Option<SchemaVersion>> {
        Ok(self
            .versions(dataset)
            .await?
            .into_iter()
            .find(|v| v.version == version))
    }

    async fn reload(&self, dataset: &str) -> Result<Option<Arc<SchemaVersion>>> {
        let latest = self.versions(dataset).await?.pop().map(Arc::new);
        let mut cache = self.cache.write().await;
        match &latest {
            Some(v) => {
                cache.insert(dataset.to_string(), Arc::clone(v));
            }
            None => {
                cache.remove(dataset);
            }
        }
        Ok(latest)
    }

    /// Decide whether `observed` fits the dataset's schema, publishing a new
    /// version when it needs to evolve.
    pub async fn propose_schema(
        &self,
        dataset: &str,
        observed: &[FieldDef],
    ) -> Result<SchemaDecision> {
        let lock = self.dataset_lock(dataset);
        let _guard = lock.lock().await;

        for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
            let current = self.current(dataset).await?;
            match evaluate(current.as_deref(), observed, self.lattice(dataset)) {
                Evaluation::Unchanged => {
                    let Some(current) = current else {
                        return Err(StoreError::Corrupt {
                            message: format!("dataset '{dataset}' has no schema to accept"),
                        }
                        .into());
                    };
                    debug!(dataset, version = current.version, "Schema accepted");
                    return Ok(SchemaDecision::Accepted(current));
                }
                Evaluation::Incompatible(reason) => {
                    warn!(dataset, %reason, "Schema incompatible");
                    return Ok(SchemaDecision::Incompatible { reason });
                }
                Evaluation::Evolve { fields, changes } => {
                    let next = SchemaVersion {
                        dataset: dataset.to_string(),
                        version: current.as_ref().map_or(1, |c| c.version + 1),
                        fields,
                        parent_version: current.as_ref().map(|c| c.version),
                        changes: changes.clone(),
                        created_at: Utc::now(),
                    };
                    if self.store.publish_schema(&next).await? {
                        let next = Arc::new(next);
                        self.cache
                            .write()
                            .await
                            .insert(dataset.to_string(), Arc::clone(&next));
                        info!(
                            dataset,
                            version = next.version,
                            changes = changes.len(),
                            "Published schema version"
                        );
                        return Ok(SchemaDecision::EvolutionRequired {
                            version: next,
                            diff: changes,
                        });
                    }
                    warn!(dataset, attempt, "Lost schema publish race, reloading");
                    self.reload(dataset).await?;
                }
            }
        }

        Err(SchemaError::PublishContention {
            dataset: dataset.to_string(),
            attempts: MAX_PUBLISH_ATTEMPTS,
        }
        .into())
    }
}

fn check_contiguous(dataset: &str, versions: &[SchemaVersion]) -> Result<()> {
    for (idx, v) in versions.iter().enumerate() {
        let expected = idx as u32 + 1;
        if v.version != expected {
            return Err(SchemaError::BrokenLog {
                dataset: dataset.to_string(),
                version: expected,
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteTableStore;
    use serde_json::json;

    fn f(name: &str, t: FieldType, nullable: bool) -> FieldDef {
        FieldDef::new(name, t, nullable)
    }

    fn base() -> Vec<FieldDef> {
        vec![
            f("sensor_id", FieldType::String, false),
            f("timestamp", FieldType::Timestamp, false),
            f("temperature", FieldType::Float, false),
        ]
    }

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(Arc::new(SqliteTableStore::open_in_memory().unwrap()))
    }

    #[test]
    fn test_evaluate_first_version() {
        let eval = evaluate(None, &base(), &CompatibilityLattice::default());
        match eval {
            Evaluation::Evolve { fields, changes } => {
                assert_eq!(fields, base());
                assert_eq!(changes.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_evaluate_subset_is_unchanged() {
        let current = SchemaVersion {
            dataset: "s".into(),
            version: 1,
            fields: base(),
            parent_version: None,
            changes: Vec::new(),
            created_at: Utc::now(),
        };
        let subset = vec![
            f("sensor_id", FieldType::String, false),
            f("temperature", FieldType::Integer, false),
        ];
        assert_eq!(
            evaluate(Some(&current), &subset, &CompatibilityLattice::default()),
            Evaluation::Unchanged
        );
    }

    #[test]
    fn test_evaluate_incompatible_numeric_to_string() {
        let current = SchemaVersion {
            dataset: "s".into(),
            version: 1,
            fields: base(),
            parent_version: None,
            changes: Vec::new(),
            created_at: Utc::now(),
        };
        let observed = vec![f("temperature", FieldType::String, false)];
        assert!(matches!(
            evaluate(Some(&current), &observed, &CompatibilityLattice::default()),
            Evaluation::Incompatible(_)
        ));
    }

    #[tokio::test]
    async fn test_first_file_publishes_version_one() {
        let registry = registry();
        let decision = registry.propose_schema("sensors", &base()).await.unwrap();
        match decision {
            SchemaDecision::EvolutionRequired { version, diff } => {
                assert_eq!(version.version, 1);
                assert_eq!(version.parent_version, None);
                assert_eq!(diff.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        let again = registry.propose_schema("sensors", &base()).await.unwrap();
        assert!(matches!(again, SchemaDecision::Accepted(v) if v.version == 1));
    }

    #[tokio::test]
    async fn test_added_field_evolves_and_old_rows_conform() {
        let registry = registry();
        registry.propose_schema("sensors", &base()).await.unwrap();
        let mut observed = base();
        observed.push(f("humidity", FieldType::Float, false));

        let decision = registry.propose_schema("sensors", &observed).await.unwrap();
        let SchemaDecision::EvolutionRequired { version, diff } = decision else {
            panic!("expected evolution");
        };
        assert_eq!(version.version, 2);
        assert_eq!(version.parent_version, Some(1));
        assert_eq!(
            diff,
            vec![SchemaChange::FieldAdded {
                field: "humidity".into(),
                field_type: FieldType::Float,
            }]
        );
        let humidity = version.field("humidity").unwrap();
        assert!(humidity.nullable);

        let old_row = json!({"sensor_id": "S1", "timestamp": "2024-01-01 00:00:00", "temperature": 21.5});
        let old_row = old_row.as_object().unwrap();
        assert!(version.conforms(old_row).is_ok());
        let projected = version.project(old_row);
        assert_eq!(projected["humidity"], Value::Null);
        assert_eq!(
            projected.keys().collect::<Vec<_>>(),
            vec!["sensor_id", "timestamp", "temperature", "humidity"]
        );
    }

    #[tokio::test]
    async fn test_widening_and_nullability() {
        let registry = registry();
        registry
            .propose_schema("sensors", &[f("count", FieldType::Integer, false)])
            .await
            .unwrap();
        let decision = registry
            .propose_schema("sensors", &[f("count", FieldType::Float, true)])
            .await
            .unwrap();
        let SchemaDecision::EvolutionRequired { version, diff } = decision else {
            panic!("expected evolution");
        };
        assert_eq!(diff.len(), 2);
        assert_eq!(version.field("count").unwrap().field_type, FieldType::Float);
        assert!(version.field("count").unwrap().nullable);
    }

    #[tokio::test]
    async fn test_incompatible_leaves_log_untouched() {
        let registry = registry();
        registry.propose_schema("sensors", &base()).await.unwrap();
        let decision = registry
            .propose_schema("sensors", &[f("temperature", FieldType::Boolean, false)])
            .await
            .unwrap();
        assert!(matches!(decision, SchemaDecision::Incompatible { .. }));
        assert_eq!(registry.versions("sensors").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_custom_lattice() {
        let lattice = CompatibilityLattice::from_widenings(&[crate::schema::Widening {
            from: FieldType::Float,
            to: FieldType::String,
        }]);
        let registry = registry().with_lattice("logs", lattice);
        registry
            .propose_schema("logs", &[f("code", FieldType::Float, false)])
            .await
            .unwrap();
        let decision = registry
            .propose_schema("logs", &[f("code", FieldType::String, false)])
            .await
            .unwrap();
        assert!(matches!(decision, SchemaDecision::EvolutionRequired { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_registries_serialize_through_store() {
        let store: Arc<dyn TableStore> = Arc::new(SqliteTableStore::open_in_memory().unwrap());
        let a = Arc::new(SchemaRegistry::new(Arc::clone(&store)));
        let b = Arc::new(SchemaRegistry::new(Arc::clone(&store)));
        a.propose_schema("sensors", &base()).await.unwrap();
        b.propose_schema("sensors", &base()).await.unwrap();

        let mut with_humidity = base();
        with_humidity.push(f("humidity", FieldType::Float, true));
        let mut with_pressure = base();
        with_pressure.push(f("pressure", FieldType::Float, true));

        let (ra, rb) = tokio::join!(
            a.propose_schema("sensors", &with_humidity),
            b.propose_schema("sensors", &with_pressure)
        );
        assert!(matches!(ra.unwrap(), SchemaDecision::EvolutionRequired { .. }));
        assert!(matches!(rb.unwrap(), SchemaDecision::EvolutionRequired { .. }));

        let versions = a.versions("sensors").await.unwrap();
        assert_eq!(versions.len(), 3);
        let last = versions.last().unwrap();
        assert!(last.field("humidity").is_some());
        assert!(last.field("pressure").is_some());
    }

    #[test]
    fn test_conforms_rejects_nulls_in_required_field() {
        let version = SchemaVersion {
            dataset: "s".into(),
            version: 1,
            fields: base(),
            parent_version: None,
            changes: Vec::new(),
            created_at: Utc::now(),
        };
        let row = json!({"sensor_id": null});
        assert!(version.conforms(row.as_object().unwrap()).is_err());
        let row = json!({"sensor_id": "S1", "extra": 1});
        assert!(version.conforms(row.as_object().unwrap()).is_err());
    }
}
