//! Skip and retry policies
//!
//! A skip policy decides what happens when the source fails to produce a
//! record; a retry policy decides what happens when the processor fails on
//! one. Both are consulted by the chunk executor with the running count so
//! that tolerance stays bounded.

use std::time::Duration;

use crate::error::BatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    Skip,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Abort,
}

pub trait SkipPolicy: Send + Sync {
    /// `skip_count` is the number of records already skipped by this step
    fn should_skip(&self, error: &BatchError, skip_count: u64) -> SkipDecision;

    fn skip_limit(&self) -> u64;
}

pub trait RetryPolicy: Send + Sync {
    /// `attempt_count` is the number of failed attempts so far, including
    /// the one that produced `error`
    fn should_retry(&self, error: &BatchError, attempt_count: u32) -> RetryDecision;

    /// Pause before the next attempt
    fn backoff(&self, _attempt_count: u32) -> Duration {
        Duration::ZERO
    }
}

/// Skips malformed input up to a fixed number of records
#[derive(Debug, Clone, Copy)]
pub struct LimitCheckingSkipPolicy {
    skip_limit: u64,
}

impl LimitCheckingSkipPolicy {
    pub fn new(skip_limit: u64) -> Self {
        Self { skip_limit }
    }
}

impl SkipPolicy for LimitCheckingSkipPolicy {
    fn should_skip(&self, error: &BatchError, skip_count: u64) -> SkipDecision {
        if error.is_malformed_input() && skip_count < self.skip_limit {
            SkipDecision::Skip
        } else {
            SkipDecision::Abort
        }
    }

    fn skip_limit(&self) -> u64 {
        self.skip_limit
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSkipPolicy;

impl SkipPolicy for NeverSkipPolicy {
    fn should_skip(&self, _error: &BatchError, _skip_count: u64) -> SkipDecision {
        SkipDecision::Abort
    }

    fn skip_limit(&self) -> u64 {
        0
    }
}

/// Retries transient failures until `max_attempts` attempts have failed
#[derive(Debug, Clone, Copy)]
pub struct SimpleRetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

impl SimpleRetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn should_retry(&self, error: &BatchError, attempt_count: u32) -> RetryDecision {
        if error.is_transient() && attempt_count < self.max_attempts {
            RetryDecision::Retry
        } else {
            RetryDecision::Abort
        }
    }

    fn backoff(&self, _attempt_count: u32) -> Duration {
        self.backoff
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetryPolicy;

impl RetryPolicy for NeverRetryPolicy {
    fn should_retry(&self, _error: &BatchError, _attempt_count: u32) -> RetryDecision {
        RetryDecision::Abort
    }
}
