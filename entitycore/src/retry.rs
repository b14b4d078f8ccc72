//! Caller-side retry of conflicting commands.
//!
//! A concurrency conflict means the entity reloaded its state and the command
//! can be tried again as-is. [`execute_with_retry`] does that with exponential
//! backoff and jitter; every other error is returned immediately.

use crate::config::{BackoffMultiplier, MaxRetryAttempts};
use crate::errors::CommandError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry configuration for command execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: MaxRetryAttempts,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: BackoffMultiplier,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MaxRetryAttempts::default(),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: BackoffMultiplier::default(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), with ±25% jitter, never
    /// above `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let multiplier: f64 = self.backoff_multiplier.into();
        let max = self.max_delay.as_secs_f64();
        let delay = (self.base_delay.as_secs_f64() * multiplier.powi(exponent)).min(max);

        let jitter = delay * 0.25 * rand::rng().random_range(-1.0..=1.0);
        Duration::from_secs_f64((delay + jitter).clamp(0.0, max))
    }
}

/// Runs `attempt` until it succeeds, fails with a non-retryable error, or the
/// configured number of attempts is exhausted.
pub async fn execute_with_retry<T, F, Fut>(
    config: &RetryConfig,
    mut attempt: F,
) -> Result<T, CommandError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CommandError>>,
{
    let max_attempts: u32 = config.max_attempts.into();
    let mut tries = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && tries + 1 < max_attempts => {
                let delay = config.delay_for(tries);
                tracing::debug!(
                    attempt = tries + 1,
                    max_attempts,
                    delay_ms = delay.as_millis(),
                    %error,
                    "retrying command after concurrency conflict"
                );
                tokio::time::sleep(delay).await;
                tries += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
