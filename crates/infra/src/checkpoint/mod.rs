//! Checkpoint persistence.
//!
//! A checkpoint is the resume position reached after the last event whose
//! dispatch finished, keyed by `(stream, job)`. It enables:
//! - Resume after crash (the consumer reopens the stream after the checkpoint)
//! - Bounded reprocessing (at most the in-flight event is replayed)
//!
//! Records are created on the first write, overwritten afterwards and never
//! deleted by the engine.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use changefeed_core::{JobName, ResumePosition, StreamName};

use crate::retry::{RetryPolicy, retry_with_backoff};

pub use in_memory::InMemoryCheckpointStore;
pub use postgres::PostgresCheckpointStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("checkpoint storage error: {0}")]
    Storage(String),
}

/// Durable `(stream, job) -> position` mapping.
///
/// Implementations perform point reads and point upserts only.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last persisted position, or `None` when no event was processed yet.
    async fn get(
        &self,
        stream: &StreamName,
        job: &JobName,
    ) -> Result<Option<ResumePosition>, CheckpointError>;

    /// Upsert the position for `(stream, job)`.
    async fn set(
        &self,
        stream: &StreamName,
        job: &JobName,
        position: &ResumePosition,
    ) -> Result<(), CheckpointError>;
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn get(
        &self,
        stream: &StreamName,
        job: &JobName,
    ) -> Result<Option<ResumePosition>, CheckpointError> {
        (**self).get(stream, job).await
    }

    async fn set(
        &self,
        stream: &StreamName,
        job: &JobName,
        position: &ResumePosition,
    ) -> Result<(), CheckpointError> {
        (**self).set(stream, job, position).await
    }
}

/// Checkpoint handle bound to one `(stream, job)` key.
///
/// Every read and write is retried under the checkpoint I/O policy, so with the
/// default unbounded policy a call blocks until storage accepts it. Progress is
/// never dropped on a transient storage failure.
#[derive(Clone)]
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    stream: StreamName,
    job: JobName,
    policy: RetryPolicy,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn CheckpointStore>, stream: StreamName, job: JobName) -> Self {
        Self {
            store,
            stream,
            job,
            policy: RetryPolicy::checkpoint_io(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn stream(&self) -> &StreamName {
        &self.stream
    }

    pub fn job(&self) -> &JobName {
        &self.job
    }

    /// Read the resume point.
    pub async fn load(&self) -> Result<Option<ResumePosition>, CheckpointError> {
        retry_with_backoff(&self.policy, "checkpoint.get", || {
            self.store.get(&self.stream, &self.job)
        })
        .await
    }

    /// Persist `position` as the new resume point.
    pub async fn commit(&self, position: &ResumePosition) -> Result<(), CheckpointError> {
        retry_with_backoff(&self.policy, "checkpoint.set", || {
            self.store.set(&self.stream, &self.job, position)
        })
        .await?;
        debug!(stream = %self.stream, job = %self.job, position = %position, "checkpoint committed");
        Ok(())
    }
}

impl core::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Checkpointer")
            .field("stream", &self.stream)
            .field("job", &self.job)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> (StreamName, JobName) {
        (StreamName::new("posts").unwrap(), JobName::new("auditlogs").unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn commit_retries_until_storage_recovers() {
        let store = InMemoryCheckpointStore::arc();
        store.fail_next(3);
        let (stream, job) = key();
        let checkpointer = Checkpointer::new(store.clone(), stream.clone(), job.clone());

        checkpointer.commit(&ResumePosition::new("5-0")).await.unwrap();

        assert_eq!(store.get(&stream, &job).await.unwrap(), Some(ResumePosition::new("5-0")));
        assert_eq!(store.set_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn load_retries_transient_failures() {
        let store = InMemoryCheckpointStore::arc();
        let (stream, job) = key();
        store.set(&stream, &job, &ResumePosition::new("9-1")).await.unwrap();
        store.fail_next(2);

        let checkpointer = Checkpointer::new(store, stream, job);
        assert_eq!(checkpointer.load().await.unwrap(), Some(ResumePosition::new("9-1")));
    }

    #[tokio::test]
    async fn bounded_policy_surfaces_error() {
        let store = InMemoryCheckpointStore::arc();
        store.fail_next(5);
        let (stream, job) = key();
        let checkpointer = Checkpointer::new(store, stream, job).with_policy(RetryPolicy::new(
            std::time::Duration::ZERO,
            std::time::Duration::ZERO,
            Some(2),
        ));

        assert!(matches!(
            checkpointer.load().await,
            Err(CheckpointError::Storage(_))
        ));
    }
}
