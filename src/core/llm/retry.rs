//! Bounded retries with capped exponential backoff.
//!
//! Every error is treated as retryable, including malformed-request
//! responses; callers that need to fail fast on invalid input must check
//! before submitting.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after a failed attempt, 1-based.
    /// `base * multiplier^(attempt-1)`, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Run `call` up to `policy.max_attempts` times, sleeping the backoff delay
/// between attempts. Returns the first success or the last error.
pub async fn call_with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 1..=policy.max_attempts.max(1) {
        match call().await {
            Ok(out) => {
                if attempt > 1 {
                    info!("{}: attempt {} succeeded", label, attempt);
                }
                return Ok(out);
            }
            Err(e) => {
                if attempt < policy.max_attempts {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "{}: attempt {} failed ({}), retrying in {:?}",
                        label, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{}: no attempts were made", label)))
}
