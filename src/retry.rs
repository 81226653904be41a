use anyhow::{Context, Result};
use std::{future::Future, time::Duration};
use tracing::warn;

use crate::constants::{RETRY_BASE_DELAY_SECS, RETRY_MAX_ATTEMPTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(RETRY_BASE_DELAY_SECS),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Runs `op` until it succeeds or `policy.max_attempts` attempts have
/// failed, sleeping `base_delay × attempt` between attempts.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "{label}: attempt {attempt}/{max_attempts} failed: {err:#}; retrying in {}s",
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("{label} failed after {max_attempts} attempts"));
            }
        }
    }
}
