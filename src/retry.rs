//! Bounded retry with exponential backoff for external calls.
//!
//! Every suspension point in the pipeline (embedding, boundary inference,
//! graph submission) goes through [`with_retry`]: each attempt is wrapped in
//! a timeout, only retryable [`ProviderError`]s are retried, and the number
//! of attempts is always `max_retries + 1`.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ProviderError;

/// Exponent cap for the backoff multiplier (`2^5 = 32x`).
const MAX_BACKOFF_SHIFT: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay before `attempt` (1-based retry number): `backoff * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(MAX_BACKOFF_SHIFT);
        self.backoff * (1u32 << shift)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(30),
            backoff: Duration::from_secs(1),
        }
    }
}

pub async fn with_retry<T, F, Fut>(
    service: &str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }

        let outcome = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(policy.timeout)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                warn!(service, attempt, error = %e, "external call failed, will retry");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        ProviderError::Unavailable(format!("{} failed after retries", service))
    }))
}
