//! Bounded retry for optimistic read-modify-write cycles.
//!
//! Every store mutation in the engine is a closure that reads the current
//! version, computes the new value, and attempts a conditioned write. When
//! the write loses a race the closure reports [`Attempt::Retry`] and
//! [`CasRetry::run`] sleeps briefly before the next round.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Outcome of one optimistic attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// The conditioned write lost a race; read again.
    Retry,
}

/// Retry policy for compare-and-set loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasRetry {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for CasRetry {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            base_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(50),
        }
    }
}

impl CasRetry {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based): doubles from the base, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        (self.base_backoff * factor).min(self.max_backoff)
    }

    /// Run `op` until it completes, fails, or exhausts the attempt budget.
    ///
    /// `key` names the contended record in the resulting
    /// [`EngineError::ConcurrentUpdate`].
    pub async fn run<T, F>(&self, key: &str, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> EngineResult<Attempt<T>>,
    {
        for attempt in 1..=self.max_attempts {
            match op()? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry if attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    debug!(%key, attempt, ?delay, "write conflict, retrying");
                    tokio::time::sleep(delay).await;
                }
                Attempt::Retry => {}
            }
        }
        warn!(%key, attempts = self.max_attempts, "giving up after repeated write conflicts");
        Err(EngineError::ConcurrentUpdate {
            key: key.to_string(),
            attempts: self.max_attempts,
        })
    }
}
