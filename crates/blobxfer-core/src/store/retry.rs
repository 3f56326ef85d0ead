//! Retry wrapper for REST calls.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::{trace, warn};

use super::StoreError;
use crate::config::TransferConfig;

/// Retries transient [`StoreError`]s with randomized exponential backoff.
///
/// A call and all of its retries share one time budget. Once the next sleep
/// would overrun the budget the last error is returned wrapped in
/// [`StoreError::RetryBudgetExhausted`]. Without a budget, transient errors
/// are retried until the call succeeds or the abort flag is raised.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    budget: Option<Duration>,
    abort: Option<Arc<AtomicBool>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            budget: None,
            abort: None,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry.base_delay_ms),
            Duration::from_millis(config.retry.max_delay_ms),
        )
        .with_budget(config.timeout())
    }

    #[must_use]
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    /// Stops retrying once `flag` is set.
    #[must_use]
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// The exponential delay is capped at the configured maximum and then
    /// jittered uniformly into its upper half.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let exp = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        let ceiling = exp.as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(ceiling / 2..=ceiling))
    }

    fn aborted(&self) -> bool {
        self.abort
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Runs `call` until it succeeds, fails permanently, or the budget runs out.
    pub fn run<T, F>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match call() {
                Ok(value) => {
                    if attempt > 1 {
                        trace!(op, attempt, "store call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if self.aborted() {
                return Err(err);
            }

            let delay = self.backoff(attempt);
            if let Some(budget) = self.budget
                && started.elapsed() + delay > budget
            {
                warn!(op, attempt, budget_ms = budget.as_millis() as u64, error = %err, "retry budget exhausted");
                return Err(StoreError::RetryBudgetExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            warn!(
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient store error, retrying"
            );
            thread::sleep(delay);
        }
    }
}
