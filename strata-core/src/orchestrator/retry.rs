//! Bounded stage retry with jittered exponential backoff.
//!
//! ```text
//! Attempting ──ok──► Succeeded
//!     │
//!     ├─transient, budget left──► Backoff ──sleep──► Attempting
//!     ├─transient, no budget────► Exhausted
//!     └─structural──────────────► Terminal
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{PipelineError, Result, StrataError};
use crate::types::Stage;

const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Retry budget and delay curve for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            jitter: config.jitter,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay after the failed attempt number `attempt` (1-based): the capped
    /// exponential delay, scaled into `[0.5, 1.0]` of itself when jittered.
    pub fn delay_for<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.base_delay.as_millis() as f64 * BACKOFF_MULTIPLIER.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let millis = if self.jitter {
            capped * rng.gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// State of a [`RetryMachine`]. `attempt` counts attempts started so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
    Terminal { attempts: u32 },
}

impl RetryState {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            RetryState::Succeeded { .. } | RetryState::Exhausted { .. } | RetryState::Terminal { .. }
        )
    }
}

/// Explicit bounded-retry state machine. The caller drives it by reporting
/// the outcome of each attempt.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    policy: RetryPolicy,
    state: RetryState,
}

impl RetryMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Attempting { attempt: 1 },
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        match self.state {
            RetryState::Attempting { attempt } | RetryState::Backoff { attempt, .. } => attempt,
            RetryState::Succeeded { attempts }
            | RetryState::Exhausted { attempts }
            | RetryState::Terminal { attempts } => attempts,
        }
    }

    pub fn succeed(&mut self) -> RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            self.state = RetryState::Succeeded { attempts: attempt };
        }
        self.state
    }

    /// Record a failed attempt. Only meaningful while Attempting.
    pub fn fail<R: Rng>(&mut self, transient: bool, rng: &mut R) -> RetryState {
        let RetryState::Attempting { attempt } = self.state else {
            return self.state;
        };
        self.state = if !transient {
            RetryState::Terminal { attempts: attempt }
        } else if attempt > self.policy.max_retries {
            RetryState::Exhausted { attempts: attempt }
        } else {
            RetryState::Backoff {
                attempt,
                delay: self.policy.delay_for(attempt, rng),
            }
        };
        self.state
    }

    /// Leave Backoff for the next attempt.
    pub fn resume(&mut self) -> RetryState {
        if let RetryState::Backoff { attempt, .. } = self.state {
            self.state = RetryState::Attempting {
                attempt: attempt + 1,
            };
        }
        self.state
    }
}

/// Run `operation` under `policy`, retrying transient failures.
///
/// Returns the result and the number of attempts made. Exhaustion surfaces
/// as [`PipelineError::RetriesExhausted`]; structural errors are returned as
/// they are. Cancellation during backoff ends the loop.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    stage: Stage,
    cancel: &CancellationToken,
    mut operation: F,
) -> (Result<T>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut machine = RetryMachine::new(policy.clone());
    loop {
        let attempt = machine.attempts();
        let err = match operation(attempt).await {
            Ok(value) => {
                machine.succeed();
                return (Ok(value), attempt);
            }
            Err(e) => e,
        };

        let transient = err.is_transient();
        let next = machine.fail(transient, &mut rand::thread_rng());
        match next {
            RetryState::Backoff { attempt, delay } => {
                tracing::warn!(
                    stage = %stage,
                    attempt,
                    max = policy.max_retries,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return (
                            Err(PipelineError::Cancelled { stage: stage.to_string() }.into()),
                            attempt,
                        );
                    }
                }
                machine.resume();
            }
            RetryState::Exhausted { attempts } => {
                tracing::error!(stage = %stage, attempts, error = %err, "Retries exhausted");
                let exhausted: StrataError = PipelineError::RetriesExhausted {
                    stage: stage.to_string(),
                    attempts,
                    last_error: err.to_string(),
                }
                .into();
                return (Err(exhausted), attempts);
            }
            RetryState::Terminal { attempts } => return (Err(err), attempts),
            RetryState::Attempting { .. } | RetryState::Succeeded { .. } => {
                return (Err(err), machine.attempts());
            }
        }
    }
}
