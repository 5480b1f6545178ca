//! Bounded retry with exponential backoff

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Attempt cap and geometric backoff schedule for batch commits
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Policy that retries without sleeping, for tests and simulations
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;
        if !delay_ms.is_finite() || delay_ms >= max_ms {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }
}

/// Result of a bounded retry loop
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    /// Attempt cap reached, or a non-transient error stopped the loop early
    Exhausted { attempts: u32, error: Error },
}

impl<T> RetryOutcome<T> {
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Succeeded { value, .. } => Ok(value),
            Self::Exhausted { error, .. } => Err(error),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error,
/// or `policy.max_attempts` attempts have been made.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                };
            }
            Err(error) if !error.is_transient() || attempt >= max_attempts => {
                return RetryOutcome::Exhausted {
                    attempts: attempt,
                    error,
                };
            }
            Err(error) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
