//! Dispatch outcome types.

use std::time::Duration;

use serde::Serialize;

/// Result of one job attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "error")]
pub enum AttemptOutcome {
    Success,
    RetryableFailure(String),
    PermanentFailure(String),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

/// Record of a single attempt (never persisted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobAttempt {
    /// 1-based.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    /// Backoff slept before this attempt; `None` for the first attempt.
    pub backoff_before: Option<Duration>,
}

/// Terminal outcome of dispatching one event.
///
/// The consumer advances the checkpoint identically for all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Success,
    /// Dead-lettered after a permanent failure; no further attempts were made.
    PermanentFailure,
    /// Dead-lettered after every allowed attempt failed with a retryable error.
    RetryableFailureExhausted,
}

impl DispatchOutcome {
    pub fn is_dead_lettered(&self) -> bool {
        !matches!(self, DispatchOutcome::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    pub attempts: Vec<JobAttempt>,
    pub elapsed: Duration,
}

impl DispatchReport {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Sum of all backoff sleeps between attempts.
    pub fn total_backoff(&self) -> Duration {
        self.attempts.iter().filter_map(|a| a.backoff_before).sum()
    }
}
