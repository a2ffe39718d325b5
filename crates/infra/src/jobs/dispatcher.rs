//! Event dispatcher: runs one job for one event to a terminal outcome.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{error, info, warn};

use changefeed_core::{ChangeEvent, JobName, StreamName};
use changefeed_events::{
    DeadLetter, DeadLetterReason, DeadLetterSink, Job, JobContext, JobError, MalformedEntry,
};

use super::types::{AttemptOutcome, DispatchOutcome, DispatchReport, JobAttempt};
use crate::dead_letter::publish_with_retry;
use crate::retry::{RetryDecision, RetryPolicy};

/// Runs the job for each event with local retries and dead-letters events
/// that cannot complete.
///
/// `dispatch` never fails: every event ends as success, permanent failure or
/// exhausted retries, and the latter two are dead-lettered before returning.
pub struct EventDispatcher {
    stream: StreamName,
    job_name: JobName,
    job: Arc<dyn Job>,
    dead_letters: Arc<dyn DeadLetterSink>,
    job_policy: RetryPolicy,
    io_policy: RetryPolicy,
}

impl EventDispatcher {
    pub fn new(
        stream: StreamName,
        job_name: JobName,
        job: Arc<dyn Job>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            stream,
            job_name,
            job,
            dead_letters,
            job_policy: RetryPolicy::job_local(),
            io_policy: RetryPolicy::checkpoint_io(),
        }
    }

    /// Policy for retrying the job itself (default: 3 attempts, 1s..10s).
    pub fn with_job_policy(mut self, policy: RetryPolicy) -> Self {
        self.job_policy = policy;
        self
    }

    /// Policy for dead-letter publishes (default: unbounded, 1s..10s).
    pub fn with_io_policy(mut self, policy: RetryPolicy) -> Self {
        self.io_policy = policy;
        self
    }

    pub fn job_name(&self) -> &JobName {
        &self.job_name
    }

    pub async fn dispatch(&self, event: &ChangeEvent) -> DispatchReport {
        let started = Instant::now();
        let resource_id = self
            .job
            .resource_id(event)
            .unwrap_or_else(|| "<unknown>".to_string());

        let mut attempts = Vec::new();
        let mut attempt = 1;
        let mut backoff_before = None;

        let outcome = loop {
            let ctx = JobContext::new(attempt, self.job_policy.max_attempts);
            let result = self.job.run(&ctx, &self.stream, event).await;

            match result {
                Ok(()) => {
                    attempts.push(JobAttempt {
                        attempt_number: attempt,
                        outcome: AttemptOutcome::Success,
                        backoff_before,
                    });
                    info!(
                        job = %self.job_name,
                        event_id = %event.id(),
                        resource_id = %resource_id,
                        attempts = attempt,
                        "job completed after {attempt} attempt(s)"
                    );
                    break DispatchOutcome::Success;
                }
                Err(JobError::Permanent(msg)) => {
                    attempts.push(JobAttempt {
                        attempt_number: attempt,
                        outcome: AttemptOutcome::PermanentFailure(msg.clone()),
                        backoff_before,
                    });
                    warn!(
                        job = %self.job_name,
                        event_id = %event.id(),
                        resource_id = %resource_id,
                        attempt,
                        error = %msg,
                        "job failed permanently"
                    );
                    self.dead_letter(event, DeadLetterReason::PermanentFailure, msg, attempt)
                        .await;
                    break DispatchOutcome::PermanentFailure;
                }
                Err(JobError::Retryable(msg)) => {
                    attempts.push(JobAttempt {
                        attempt_number: attempt,
                        outcome: AttemptOutcome::RetryableFailure(msg.clone()),
                        backoff_before,
                    });
                    match self.job_policy.decide(attempt) {
                        RetryDecision::Wait(delay) => {
                            warn!(
                                job = %self.job_name,
                                event_id = %event.id(),
                                resource_id = %resource_id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %msg,
                                "job failed; retrying"
                            );
                            tokio::time::sleep(delay).await;
                            backoff_before = Some(delay);
                            attempt += 1;
                        }
                        RetryDecision::GiveUp => {
                            error!(
                                job = %self.job_name,
                                event_id = %event.id(),
                                resource_id = %resource_id,
                                attempts = attempt,
                                error = %msg,
                                "job retries exhausted"
                            );
                            self.dead_letter(event, DeadLetterReason::RetriesExhausted, msg, attempt)
                                .await;
                            break DispatchOutcome::RetryableFailureExhausted;
                        }
                    }
                }
            }
        };

        DispatchReport {
            outcome,
            attempts,
            elapsed: started.elapsed(),
        }
    }

    async fn dead_letter(
        &self,
        event: &ChangeEvent,
        reason: DeadLetterReason,
        error: String,
        attempts: u32,
    ) {
        let letter = DeadLetter::new(
            self.stream.clone(),
            self.job_name.clone(),
            event.clone(),
            reason,
            error,
            attempts,
        );
        // Failure is already logged; the consumer still moves on.
        let _ = publish_with_retry(self.dead_letters.as_ref(), &letter, &self.io_policy).await;
    }

    /// Dead-letter a stream entry that never decoded into an event. The job is
    /// not run.
    pub async fn dead_letter_malformed(&self, entry: &MalformedEntry) {
        warn!(
            job = %self.job_name,
            entry_id = %entry.id,
            error = %entry.reason,
            "dead-lettering undecodable stream entry"
        );
        let letter = DeadLetter::malformed(self.stream.clone(), self.job_name.clone(), entry.clone());
        let _ = publish_with_retry(self.dead_letters.as_ref(), &letter, &self.io_policy).await;
    }
}

impl core::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("stream", &self.stream)
            .field("job", &self.job_name)
            .field("job_policy", &self.job_policy)
            .field("io_policy", &self.io_policy)
            .finish_non_exhaustive()
    }
}
