//! Aggregation: hourly and daily gold windows maintained incrementally from
//! silver.

pub mod engine;
pub mod window;

pub use engine::{
    AggregationEngine, AggregationReport, RefreshOutcome, compute_window, input_digest,
};
pub use window::{WindowKey, WindowState, WindowStatus};
