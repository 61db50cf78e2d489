//! Bounded retry with exponential backoff for store and provider calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use rag_core::{RagError, Result, RetryConfig, StoreKind};

/// What a retried call talks to; decides the error reported on timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Store(StoreKind),
    Provider,
}

impl Target {
    fn timed_out(&self, label: &str, after: Duration) -> RagError {
        let message = format!("{} timed out after {}ms", label, after.as_millis());
        match self {
            Self::Store(kind) => RagError::store(*kind, message),
            Self::Provider => RagError::provider(message),
        }
    }
}

/// Retry policy.
///
/// Each attempt is bounded by `operation_timeout`. Only transient errors
/// (store unavailable, provider failure, timeouts) are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub operation_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let nanos = self.initial_backoff.as_nanos() as f64 * factor;
        Duration::from_nanos(nanos.min(u64::MAX as f64) as u64).min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, target: Target, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.operation_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(target.timed_out(label, self.operation_timeout)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        call = ?target,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed, retrying: {}",
                        label,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
