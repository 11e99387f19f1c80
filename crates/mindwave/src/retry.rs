//! # Retry Policies
//!
//! Exponential backoff for connection attempts against the ThinkGear
//! Connector.
//!
//! [`Connector::start`](crate::Connector::start) makes up to `n_tries`
//! attempts. Each failed attempt (refused socket, or no headset data before
//! the timeout) is followed by a delay that doubles from
//! [`RetryConfig::base_delay_ms`](crate::config::RetryConfig) up to the cap.
//!
//! ## Usage
//!
//! ```rust
//! use mindwave::retry::{RetryPolicy, with_retry};
//! use mindwave::MindwaveError;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::time::Duration;
//!
//! let attempts = AtomicU32::new(0);
//! let rt = tokio::runtime::Builder::new_current_thread()
//!     .enable_time()
//!     .build()
//!     .unwrap();
//!
//! let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
//! let result = rt.block_on(with_retry(&policy, |_attempt| {
//!     let n = attempts.fetch_add(1, Ordering::SeqCst);
//!     async move {
//!         if n == 0 {
//!             Err(MindwaveError::Timeout { millis: 10 })
//!         } else {
//!             Ok::<_, MindwaveError>("streaming")
//!         }
//!     }
//! }));
//!
//! assert_eq!(result.unwrap(), "streaming");
//! assert_eq!(attempts.load(Ordering::SeqCst), 2);
//! ```

use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{MindwaveError, MindwaveResult};

/// How many times an operation runs and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero means the operation never
    /// runs.
    pub max_attempts: u32,

    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Maximum delay between attempts (exponential backoff cap).
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Custom backoff policy.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// A single attempt, no retry.
    #[must_use]
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Policy for `attempts` tries using the configured backoff.
    ///
    /// ```
    /// use mindwave::config::RetryConfig;
    /// use mindwave::retry::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::from_config(4, &RetryConfig::default());
    /// assert_eq!(policy.max_attempts, 4);
    /// assert_eq!(policy.delay_before(2), Duration::from_secs(1));
    /// assert_eq!(policy.delay_before(3), Duration::from_secs(2));
    /// ```
    #[must_use]
    pub fn from_config(attempts: u32, config: &RetryConfig) -> Self {
        Self::new(attempts, config.base_delay(), config.max_delay())
    }

    /// Delay to wait before attempt number `attempt` (1-based).
    ///
    /// The first attempt runs immediately; after that the delay doubles
    /// from `base_delay` and saturates at `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let doublings = (attempt - 2).min(31);
        self.base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}

/// Execute an async operation with retry logic.
///
/// The closure receives the 1-based attempt number. The operation is retried
/// when the error is retryable (see [`MindwaveError::is_retryable`]);
/// anything else is returned immediately.
///
/// On exhaustion, returns [`MindwaveError::RetriesExhausted`] wrapping the
/// last error. A policy with `max_attempts == 0` fails with
/// `RetriesExhausted { attempts: 0 }` wrapping [`MindwaveError::NotConnected`]
/// without running the operation.
///
/// # Errors
/// Returns any non-retryable error from the operation, or
/// [`MindwaveError::RetriesExhausted`] when attempts run out.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> MindwaveResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = MindwaveResult<T>>,
{
    let mut last_error = MindwaveError::NotConnected;

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            tracing::debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Waiting before next attempt"
            );
            tokio::time::sleep(delay).await;
        }

        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    attempt,
                    max = policy.max_attempts,
                    error = %e,
                    "Attempt failed"
                );
                last_error = e;
            }
        }
    }

    Err(MindwaveError::RetriesExhausted {
        attempts: policy.max_attempts,
        last_error: Box::new(last_error),
    })
}
