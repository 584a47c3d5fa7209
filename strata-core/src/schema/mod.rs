//! Schema registry: field typing, the widening lattice and the versioned
//! schema log of every dataset.

pub mod lattice;
pub mod registry;

pub use lattice::{
    CompatibilityLattice, FieldDef, FieldType, Widening, default_widenings, infer_fields,
    parse_timestamp,
};
pub use registry::{Evaluation, SchemaChange, SchemaDecision, SchemaRegistry, SchemaVersion, evaluate};
