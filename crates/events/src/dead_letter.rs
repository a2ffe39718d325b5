//! Dead-letter contract: where events go when their job cannot complete, and
//! where stream entries go that could not be decoded at all.
//!
//! Dead letters are for manual inspection and replay. Publishing is
//! fire-and-forget from the engine's perspective (the caller retries transport
//! failures); nothing is ever read back by the engine.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use changefeed_core::{ChangeEvent, JobName, StreamName};

use crate::source::MalformedEntry;

/// Why an event was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The job classified the failure as permanent on some attempt.
    PermanentFailure,
    /// Every attempt allowed by the job-local policy failed with a retryable error.
    RetriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::PermanentFailure => "permanent_failure",
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// What was dead-lettered. Serialized without a tag: either the change event
/// or the raw malformed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeadLetterPayload {
    Event(ChangeEvent),
    Malformed(MalformedEntry),
}

impl DeadLetterPayload {
    /// Stream-assigned id of the event or entry.
    pub fn id(&self) -> &str {
        match self {
            DeadLetterPayload::Event(event) => event.id(),
            DeadLetterPayload::Malformed(entry) => &entry.id,
        }
    }

    pub fn as_event(&self) -> Option<&ChangeEvent> {
        match self {
            DeadLetterPayload::Event(event) => Some(event),
            DeadLetterPayload::Malformed(_) => None,
        }
    }
}

/// Entry published to the dead-letter sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub stream: StreamName,
    pub job: JobName,
    pub reason: DeadLetterReason,
    /// Error of the last attempt.
    pub error: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub event: DeadLetterPayload,
}

impl DeadLetter {
    pub fn new(
        stream: StreamName,
        job: JobName,
        event: ChangeEvent,
        reason: DeadLetterReason,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            stream,
            job,
            reason,
            error: error.into(),
            attempts,
            dead_lettered_at: Utc::now(),
            event: DeadLetterPayload::Event(event),
        }
    }

    /// Letter for a stream entry that never became an event; no job ran for it.
    pub fn malformed(stream: StreamName, job: JobName, entry: MalformedEntry) -> Self {
        Self {
            id: Uuid::now_v7(),
            stream,
            job,
            reason: DeadLetterReason::PermanentFailure,
            error: entry.reason.clone(),
            attempts: 0,
            dead_lettered_at: Utc::now(),
            event: DeadLetterPayload::Malformed(entry),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeadLetterError {
    #[error("dead-letter transport error: {0}")]
    Transport(String),

    #[error("dead-letter serialization error: {0}")]
    Serialization(String),
}

/// Append-only publish target for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

#[async_trait]
impl<S> DeadLetterSink for Arc<S>
where
    S: DeadLetterSink + ?Sized,
{
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        (**self).publish(letter).await
    }
}

/// In-memory dead-letter sink for tests/dev.
///
/// Can be told to fail a number of publishes to exercise transport retries.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
    failures_remaining: AtomicU32,
    publish_calls: AtomicU32,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Fail the next `count` publishes with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish attempts, including failed ones.
    pub fn publish_calls(&self) -> u32 {
        self.publish_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeadLetterError::Transport("injected failure".to_string()));
        }

        self.letters
            .lock()
            .map_err(|_| DeadLetterError::Transport("sink lock poisoned".to_string()))?
            .push(letter.clone());
        Ok(())
    }
}
