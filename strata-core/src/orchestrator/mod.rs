//! Pipeline orchestration: stage gating, bounded retries, run history and
//! scheduling.

pub mod pipeline;
pub mod retry;

pub use pipeline::{DatasetStatus, Pipeline};
pub use retry::{RetryMachine, RetryPolicy, RetryState, run_with_retry};
