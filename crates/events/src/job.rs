//! Job contract: one attempt of the work done for a change event.
//!
//! Jobs classify their own failures as retryable or permanent; the dispatcher
//! owns retries, backoff and dead-lettering.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use changefeed_core::{ChangeEvent, StreamName};

/// Failure of a single job attempt, classified by the job itself.
///
/// The dispatcher relies on this classification to decide between a local retry
/// and immediate dead-lettering; it never inspects error types beyond this.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// A downstream dependency is unavailable or answered with a transient status.
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// The payload is malformed or was rejected for a non-transient reason.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl JobError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}

/// Per-attempt context handed to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobContext {
    /// 1-based attempt number for the current event.
    pub attempt: u32,
    /// Attempt cap of the job-local retry policy (`None` = unbounded).
    pub max_attempts: Option<u32>,
}

impl JobContext {
    pub fn new(attempt: u32, max_attempts: Option<u32>) -> Self {
        Self {
            attempt,
            max_attempts,
        }
    }

    pub fn is_final_attempt(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }
}

/// Work performed for every change event of a stream.
///
/// One attempt per call: retries, backoff and dead-lettering belong to the
/// dispatcher. Implementations must be safe to re-run for the same event, since
/// delivery is at-least-once across restarts.
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable job name, as used in checkpoint keys and logs.
    fn name(&self) -> &str;

    /// Run one attempt for `event` observed on `stream`.
    async fn run(
        &self,
        ctx: &JobContext,
        stream: &StreamName,
        event: &ChangeEvent,
    ) -> Result<(), JobError>;

    /// Identifier of the affected resource, for logs.
    ///
    /// Where it lives depends on the payload shape the job consumes.
    fn resource_id(&self, event: &ChangeEvent) -> Option<String> {
        event.document_id()
    }
}

/// Job replaying a fixed script of attempt results (tests/dev).
///
/// Once the script is exhausted every further attempt succeeds.
#[derive(Debug)]
pub struct ScriptedJob {
    name: String,
    script: Mutex<VecDeque<Result<(), JobError>>>,
    repeat: Option<Result<(), JobError>>,
    invocations: Mutex<Vec<(String, u32)>>,
}

impl ScriptedJob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            repeat: None,
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Return `result` from every attempt.
    pub fn always(name: impl Into<String>, result: Result<(), JobError>) -> Self {
        Self {
            repeat: Some(result),
            ..Self::new(name)
        }
    }

    /// Queue the result of the next unscripted attempt.
    pub fn then(self, result: Result<(), JobError>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
        self
    }

    /// `(event id, attempt)` for every call, in call order.
    pub fn invocations(&self) -> Vec<(String, u32)> {
        self.invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().map(|calls| calls.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Job for ScriptedJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        ctx: &JobContext,
        _stream: &StreamName,
        event: &ChangeEvent,
    ) -> Result<(), JobError> {
        if let Ok(mut calls) = self.invocations.lock() {
            calls.push((event.id().to_string(), ctx.attempt));
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(result) => result,
            None => self.repeat.clone().unwrap_or(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changefeed_core::OperationType;
    use serde_json::json;

    fn event(id: &str) -> ChangeEvent {
        ChangeEvent::new(id, OperationType::Insert, json!({}), "posts", json!({"_id": id}))
    }

    #[test]
    fn final_attempt_tracks_cap() {
        assert!(!JobContext::new(2, Some(3)).is_final_attempt());
        assert!(JobContext::new(3, Some(3)).is_final_attempt());
        assert!(!JobContext::new(99, None).is_final_attempt());
    }

    #[tokio::test]
    async fn scripted_job_replays_then_succeeds() {
        let job = ScriptedJob::new("audit")
            .then(Err(JobError::retryable("503")))
            .then(Err(JobError::permanent("400")));
        let stream = StreamName::new("posts").unwrap();
        let ev = event("e1");

        assert!(job.run(&JobContext::new(1, None), &stream, &ev).await.unwrap_err().is_retryable());
        assert!(!job.run(&JobContext::new(2, None), &stream, &ev).await.unwrap_err().is_retryable());
        assert!(job.run(&JobContext::new(3, None), &stream, &ev).await.is_ok());

        assert_eq!(
            job.invocations(),
            vec![("e1".to_string(), 1), ("e1".to_string(), 2), ("e1".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn always_job_repeats_result() {
        let job = ScriptedJob::always("audit", Err(JobError::retryable("down")));
        let stream = StreamName::new("posts").unwrap();
        for attempt in 1..=4 {
            let res = job.run(&JobContext::new(attempt, None), &stream, &event("e")).await;
            assert_eq!(res, Err(JobError::retryable("down")));
        }
        assert_eq!(job.invocation_count(), 4);
        assert_eq!(job.resource_id(&event("e")).as_deref(), Some("e"));
    }
}
