//! Retry and timeout utilities.
//!
//! Streaming sessions never retry on their own; these helpers back the REST
//! client and are available to callers that want to layer a retry loop on top
//! of [`crate::stream::client::StreamClient::start`].

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Default for control-plane calls (listing models, loading LoRAs).
    pub fn control_plane() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            jitter: Duration::from_millis(50),
        }
    }

    /// Policy that performs the operation exactly once.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Computes the delay to apply after the given failed attempt.
    ///
    /// `attempt` is 1-based. The base delay doubles per attempt and is capped
    /// at `max_backoff` before jitter is added.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31) as u32;
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff);
        base + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::control_plane()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number. `should_retry` decides whether a
/// failed attempt may be repeated; the last error is returned once attempts
/// are exhausted or the predicate rejects it.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    E: Display,
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "retry_attempt_failed",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    let limit_nanos = u64::try_from(max_jitter.as_nanos()).unwrap_or(u64::MAX);
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = seed ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    Duration::from_nanos(mixed % limit_nanos.saturating_add(1))
}
