//! Exponential backoff for the calls that leave the process: completion
//! requests, embedding requests and SQLite writes.
//!
//! A [`RetryPolicy`] bounds the attempts; a classifier decides per error
//! whether another attempt can help. Permanent errors end the loop at once.
//!
//! ```rust,ignore
//! let policy = RetryPolicy::db_write();
//! retry_transient(&policy, || store.put_unit(&unit)).await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::GenerationConfig;
use crate::error::{Error, GenerationError, IndexError, Result, StorageError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    /// Fraction of each delay added or removed at random.
    jitter: f64,
    /// Total attempts including the first; at least 1.
    max_attempts: u32,
}

impl RetryPolicy {
    /// Doubling backoff from `base_delay`, capped at one minute, 10% jitter.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: max_attempts.max(1),
        }
    }

    #[must_use]
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Non-finite or sub-1.0 multipliers fall back to a constant delay.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    #[must_use]
    pub fn jitter(mut self, fraction: f64) -> Self {
        self.jitter = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// One slot's budget: the first request plus `retry_count` retries,
    /// waiting `retry_backoff_base_ms` before the first retry.
    #[must_use]
    pub fn generation(config: &GenerationConfig) -> Self {
        Self::new(
            config.retry_count.saturating_add(1),
            Duration::from_millis(config.retry_backoff_base_ms),
        )
    }

    #[must_use]
    pub fn embedding(retry_count: u32) -> Self {
        Self::new(retry_count.saturating_add(1), Duration::from_millis(50))
            .max_delay(Duration::from_secs(2))
    }

    /// Short waits, five attempts; enough to ride out a competing writer.
    #[must_use]
    pub fn db_write() -> Self {
        Self::new(5, Duration::from_millis(50)).max_delay(Duration::from_secs(2))
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before retry number `retry` (1 for the first retry).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let cap = self.max_delay.as_secs_f64();
        let secs = (self.base_delay.as_secs_f64() * self.multiplier.powi(exponent)).min(cap);
        let spread = secs * self.jitter;
        let secs = if spread > 0.0 {
            rand::rng().random_range(secs - spread..=secs + spread)
        } else {
            secs
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Final result of a retried call plus what it took to get there.
#[derive(Debug)]
pub struct Retried<T, E = Error> {
    pub result: std::result::Result<T, E>,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Call `op` until it succeeds, `transient` rejects the error, or the
/// policy's attempts run out.
pub async fn run_with_retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    transient: P,
    mut op: F,
) -> Retried<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let started = tokio::time::Instant::now();
    let mut attempts = 0u32;
    let result = loop {
        attempts += 1;
        let err = match op().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(attempts, "Call succeeded on retry");
                }
                break Ok(value);
            }
            Err(err) => err,
        };
        if !transient(&err) {
            debug!(attempts, error = %err, "Permanent error; not retrying");
            break Err(err);
        }
        if attempts >= policy.max_attempts {
            warn!(attempts, error = %err, "Retries exhausted");
            break Err(err);
        }
        let wait = policy.backoff(attempts);
        debug!(attempts, wait_ms = wait.as_millis() as u64, error = %err, "Transient error; backing off");
        tokio::time::sleep(wait).await;
    };
    Retried {
        result,
        attempts,
        elapsed: started.elapsed(),
    }
}

/// Whether a crate error may clear up on its own.
#[must_use]
pub fn is_transient(error: &Error) -> bool {
    match error {
        Error::Io(_) | Error::Runtime(_) => true,
        Error::Generation(GenerationError::Backend { kind, .. }) => kind.is_transient(),
        // the breaker admits a probe once its cooldown passes
        Error::Generation(GenerationError::CircuitOpen { .. }) => true,
        // SQLITE_BUSY and friends arrive as generic database errors
        Error::Storage(StorageError::Database(_)) => true,
        Error::Index(IndexError::Embedding(_)) => true,
        Error::Generation(_)
        | Error::Storage(_)
        | Error::Index(_)
        | Error::Lifecycle(_)
        | Error::Config(_)
        | Error::Json(_)
        | Error::Cancelled(_) => false,
    }
}

/// [`run_with_retry`] with [`is_transient`] as the classifier.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run_with_retry(policy, is_transient, op).await.result
}
