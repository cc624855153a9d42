//! Retry policies for failed dispatches
//!
//! A policy looks at a normalized error and the number of attempts made so far
//! and decides whether to try again, and after what delay. Only failures where
//! no response arrived and 5xx responses are ever retried.

use std::time::Duration;

use crate::error::{ApiError, ErrorKind};

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then dispatch again
    Retry(Duration),
    /// Surface the error to the caller
    GiveUp,
}

/// Pluggable retry strategy
pub trait RetryPolicy: Send + Sync {
    /// Decide what to do after `attempt` attempts (1-based) failed with `err`
    fn decide(&self, err: &ApiError, attempt: u32) -> RetryDecision;
}

/// Whether a failure could succeed if simply tried again
///
/// Network failures (including timeouts) and 5xx are transient. 4xx, auth
/// failures and undecodable bodies are not.
pub fn is_transient(err: &ApiError) -> bool {
    matches!(err.kind(), ErrorKind::Network | ErrorKind::Server)
}

/// Retries transient failures after a constant delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy for FixedDelay {
    fn decide(&self, err: &ApiError, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts || !is_transient(err) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay)
    }
}

/// Retries transient failures with a doubling delay, capped at `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl ExponentialBackoff {
    fn delay_for(&self, attempt: u32) -> Duration {
        // attempt is 1-based, so the first retry waits base_delay
        let multiplier = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn decide(&self, err: &ApiError, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts || !is_transient(err) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }
}
