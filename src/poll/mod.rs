//! Bounded fixed-interval polling for asynchronous readiness

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

/// How often and how long to poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Upper bound on time spent sleeping between attempts
    pub fn max_wait(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(1))
    }
}

/// Predicate never held within the policy's attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("condition not met after {attempts} attempts")]
pub struct PollTimeout {
    pub attempts: u32,
}

/// Evaluate `predicate` until it holds or attempts run out.
///
/// Returns the 1-based attempt on which the predicate first held. Sleeps
/// `interval` between attempts, never after the last one.
pub async fn poll<F, Fut>(policy: PollPolicy, mut predicate: F) -> Result<u32, PollTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=policy.max_attempts {
        if predicate().await {
            trace!(attempt, "Poll condition met");
            return Ok(attempt);
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(PollTimeout {
        attempts: policy.max_attempts,
    })
}
