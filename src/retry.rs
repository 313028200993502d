//! Exponential backoff for classified failures.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ProviderError;

pub const DEFAULT_MAX_RETRIES: u32 = 4;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(2000);

/// Retry policy: a classifier deciding which errors are retryable, plus a
/// doubling backoff schedule (`base * 2^attempt`).
pub struct RetryPolicy<E> {
    max_retries: u32,
    base_delay: Duration,
    is_retryable: fn(&E) -> bool,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for RetryPolicy<E> {}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .finish()
    }
}

impl<E: fmt::Display> RetryPolicy<E> {
    pub fn new(max_retries: u32, base_delay: Duration, is_retryable: fn(&E) -> bool) -> Self {
        Self {
            max_retries,
            base_delay,
            is_retryable,
        }
    }

    /// Delay before retry number `attempt + 1` (attempt is zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Run `op` up to `1 + max_retries` times. Retryable errors sleep and try
    /// again while attempts remain; anything else is returned immediately.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && (self.is_retryable)(&err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Rate limit hit, retrying in {}ms (attempt {}/{}): {}",
                        delay.as_millis(),
                        attempt + 1,
                        self.max_retries,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl RetryPolicy<ProviderError> {
    /// Retry only rate-limit class provider failures.
    pub fn rate_limited(max_retries: u32, base_delay: Duration) -> Self {
        Self::new(max_retries, base_delay, ProviderError::is_rate_limited)
    }
}

impl Default for RetryPolicy<ProviderError> {
    fn default() -> Self {
        Self::rate_limited(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY)
    }
}
