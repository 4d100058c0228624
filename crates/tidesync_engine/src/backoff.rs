//! Retry pacing.
//!
//! Two strategies: exponential growth with jitter for ordinary request
//! retries, and a flat aggressive cadence for real-time reconnects
//! where waiting minutes between attempts would be user-visible.

use std::time::Duration;

use rand::Rng;

use crate::error::EngineError;

/// Hard ceiling on any computed wait, jitter excluded. A
/// [`RetryHandler`] stops retrying once the wait it would impose
/// exceeds this.
pub const MAX_RETRY_WAIT: Duration = Duration::from_secs(300);

const BASE_DELAY_MS: u64 = 100;
const AGGRESSIVE_DELAY_MS: u64 = 1000;
const JITTER_MS: u64 = 100;

/// How successive retry waits grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// `2^attempt * 100ms` plus jitter, capped at [`MAX_RETRY_WAIT`].
    #[default]
    Exponential,
    /// A flat second plus jitter, regardless of attempt count.
    Aggressive,
}

/// The wait before retry number `attempt` (1-based), with random jitter
/// in `[0, 100)` ms added so that clients knocked offline together do
/// not reconnect in lockstep.
pub fn retry_delay(strategy: RetryStrategy, attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
    let base_ms = uncapped_delay_ms(strategy, attempt).min(MAX_RETRY_WAIT.as_millis() as u64);
    Duration::from_millis(base_ms + jitter)
}

/// The wait an attempt would earn with no ceiling applied.
fn uncapped_delay_ms(strategy: RetryStrategy, attempt: u32) -> u64 {
    match strategy {
        RetryStrategy::Exponential => 1u64
            .checked_shl(attempt)
            .unwrap_or(u64::MAX)
            .saturating_mul(BASE_DELAY_MS),
        RetryStrategy::Aggressive => AGGRESSIVE_DELAY_MS,
    }
}

/// Retry decision for a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAdvice {
    /// Whether the request should be attempted again.
    pub should_retry: bool,
    /// How long to wait first headers permitting; `None` when not retrying.
    pub wait: Option<Duration>,
}

impl RetryAdvice {
    fn retry(wait: Duration) -> Self {
        Self { should_retry: true, wait: Some(wait) }
    }

    fn stop() -> Self {
        Self { should_retry: false, wait: None }
    }
}

/// Tracks consecutive failures of one logical request and prices the
/// next attempt.
#[derive(Debug)]
pub struct RetryHandler {
    strategy: RetryStrategy,
    attempt: u32,
}

impl RetryHandler {
    /// Creates a handler with zero recorded failures.
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy, attempt: 0 }
    }

    /// Number of failures recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Forgets accumulated failures after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Records a failure and decides whether to retry.
    ///
    /// An explicit server retry-after hint overrides the computed wait.
    /// Errors classified non-retryable stop the sequence immediately,
    /// and so does any wait that would exceed [`MAX_RETRY_WAIT`]: a
    /// request still failing by then is not worth parking its queue
    /// slot for minutes more.
    pub fn should_retry(&mut self, error: &EngineError) -> RetryAdvice {
        if !error.is_retryable() {
            return RetryAdvice::stop();
        }
        self.attempt += 1;
        if let Some(wait) = error.retry_after() {
            if wait > MAX_RETRY_WAIT {
                return RetryAdvice::stop();
            }
            return RetryAdvice::retry(wait);
        }
        if uncapped_delay_ms(self.strategy, self.attempt) > MAX_RETRY_WAIT.as_millis() as u64 {
            return RetryAdvice::stop();
        }
        RetryAdvice::retry(retry_delay(self.strategy, self.attempt))
    }
}
