//! In-memory checkpoint store for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use changefeed_core::{JobName, ResumePosition, StreamName};

use super::{CheckpointError, CheckpointStore};

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    positions: RwLock<HashMap<(StreamName, JobName), ResumePosition>>,
    failures_remaining: AtomicU32,
    set_calls: AtomicU32,
    history: RwLock<Vec<ResumePosition>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Fail the next `count` operations (reads or writes) with a storage error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Write attempts, including failed ones.
    pub fn set_calls(&self) -> u32 {
        self.set_calls.load(Ordering::SeqCst)
    }

    /// Every successfully written position, in write order.
    pub fn history(&self) -> Vec<ResumePosition> {
        self.history.read().map(|h| h.clone()).unwrap_or_default()
    }

    fn inject_failure(&self) -> Result<(), CheckpointError> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CheckpointError::Storage("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(
        &self,
        stream: &StreamName,
        job: &JobName,
    ) -> Result<Option<ResumePosition>, CheckpointError> {
        self.inject_failure()?;
        let positions = self
            .positions
            .read()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?;
        Ok(positions.get(&(stream.clone(), job.clone())).cloned())
    }

    async fn set(
        &self,
        stream: &StreamName,
        job: &JobName,
        position: &ResumePosition,
    ) -> Result<(), CheckpointError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.inject_failure()?;
        self.positions
            .write()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?
            .insert((stream.clone(), job.clone()), position.clone());
        if let Ok(mut history) = self.history.write() {
            history.push(position.clone());
        }
        Ok(())
    }
}
