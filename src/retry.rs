//! Retry mechanism with exponential backoff
//!
//! Used for cache backend operations only. External source calls are never
//! retried here; a transient source failure is reported to the caller.

use crate::config::RetryConfig;
use crate::error::{EvidenceError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy for operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt: usize,
    next_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            next_delay: config.initial_delay,
            config,
            attempt: 0,
        }
    }

    pub fn should_retry(&self) -> bool {
        self.attempt < self.config.max_retries
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Calculate next delay with exponential backoff
    pub fn next_delay(&mut self) -> Duration {
        let mut delay = self.next_delay;

        if self.config.jitter {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0.0..0.3);
            let jitter_ms = (delay.as_millis() as f64 * jitter) as u64;
            delay += Duration::from_millis(jitter_ms);
        }

        self.attempt += 1;
        self.next_delay = Duration::from_secs_f32(
            (self.next_delay.as_secs_f32() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f32()),
        );

        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = self.config.initial_delay;
    }
}

/// Determine if a storage error is worth another attempt
pub fn is_retryable(error: &EvidenceError) -> bool {
    match error {
        EvidenceError::Database(db) => match db {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
            sqlx::Error::Database(e) => {
                let msg = e.message().to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy")
            }
            _ => false,
        },
        EvidenceError::Io(_) => true,
        EvidenceError::Transient { .. } => true,
        _ => false,
    }
}

/// Retry an async operation with exponential backoff
pub async fn retry_async<F, Fut, T>(mut operation: F, policy: &mut RetryPolicy) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match operation().await {
            Ok(result) => {
                if policy.attempt() > 0 {
                    debug!(
                        "Operation succeeded after {} attempts",
                        policy.attempt() + 1
                    );
                }
                return Ok(result);
            }
            Err(error) => {
                if !is_retryable(&error) {
                    debug!("Non-retryable error: {}", error);
                    return Err(error);
                }

                if !policy.should_retry() {
                    warn!(
                        "Max retries ({}) exceeded. Last error: {}",
                        policy.config.max_retries, error
                    );
                    return Err(error);
                }

                let delay = policy.next_delay();
                warn!(
                    "Attempt {} failed: {}. Retrying in {:?}...",
                    policy.attempt(),
                    error,
                    delay
                );

                sleep(delay).await;
            }
        }
    }
}
