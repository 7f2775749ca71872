use backoff::backoff::{Backoff, Constant};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tracing::{debug, warn};

/// Fixed-delay retry policy used for device reads.
///
/// Device links are resynchronised by waiting a constant interval between
/// attempts; the delay never grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    #[serde(default = "RetryPolicy::default_attempts")]
    pub attempts: u32,

    /// Delay between two attempts in milliseconds
    #[serde(default = "RetryPolicy::default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            interval_ms: Self::default_interval_ms(),
        }
    }
}

impl RetryPolicy {
    fn default_attempts() -> u32 {
        5
    }

    fn default_interval_ms() -> u64 {
        1_000
    }

    /// Policy used for bulk history page reads
    pub fn history() -> Self {
        Self {
            attempts: 10,
            ..Default::default()
        }
    }

    /// Single attempt, fail immediately
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts,
            ..Default::default()
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Build a constant backoff from a RetryPolicy.
pub fn build_constant_backoff(policy: &RetryPolicy) -> Constant {
    Constant::new(policy.interval())
}

/// Run `op` until it succeeds, the policy is exhausted, or `is_fatal`
/// classifies the error as non-retryable. The attempt number (starting at 1)
/// is passed to `op`; the last error is returned on exhaustion.
pub async fn retry_fixed<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
    is_fatal: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut backoff = build_constant_backoff(policy);
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if is_fatal(&e) || attempt >= attempts => {
                warn!(label, attempt, error = %e, "giving up");
                return Err(e);
            }
            Err(e) => {
                debug!(label, attempt, error = %e, "attempt failed, retrying");
                if let Some(delay) = backoff.next_backoff() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
