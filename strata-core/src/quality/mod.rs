//! Quality & transformation: bronze rows become validated, deduplicated and
//! annotated silver rows.

pub mod anomaly;
pub mod engine;
pub mod rules;

pub use anomaly::{
    AnomalyContext, AnomalyPolicy, CompositePolicy, Detection, OutlierDetector, ReadingGapPolicy,
    StatisticalRangePolicy,
};
pub use engine::{QualityEngine, QualityReport};
pub use rules::extract_key;
