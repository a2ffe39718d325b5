//! Stream consumer: one pass over a change stream for one job.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use changefeed_core::ResumePosition;
use changefeed_events::{ChangeStreamSource, CursorItem, StreamFilter, StreamInterruption};

use super::shutdown::{ShutdownSignal, shutdown_requested};
use crate::checkpoint::{CheckpointError, Checkpointer};
use crate::config::PoisonEventPolicy;
use crate::jobs::EventDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    /// Loading the checkpoint and opening the stream.
    Init,
    /// Waiting for and dispatching events.
    Streaming,
    Stopped,
}

/// Why a consumer stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The source closed the stream.
    EndOfStream,
    /// The position became invalid or the transport failed.
    Interrupted(StreamInterruption),
    /// Checkpoint storage stayed unavailable past a bounded retry policy.
    CheckpointUnavailable(CheckpointError),
    /// An event was dead-lettered under [`PoisonEventPolicy::Halt`].
    PoisonEvent {
        event_id: String,
        /// Checkpoint left in place; the event is replayed after the halt is cleared.
        last_checkpoint: Option<ResumePosition>,
    },
    /// Shutdown was requested.
    Shutdown,
}

impl StopReason {
    /// Whether the supervisor should rebuild the pipeline.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            StopReason::EndOfStream | StopReason::Interrupted(_) | StopReason::CheckpointUnavailable(_)
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndOfStream => f.write_str("end of stream"),
            StopReason::Interrupted(interruption) => write!(f, "{interruption}"),
            StopReason::CheckpointUnavailable(err) => write!(f, "{err}"),
            StopReason::PoisonEvent { event_id, .. } => write!(f, "poison event {event_id}"),
            StopReason::Shutdown => f.write_str("shutdown requested"),
        }
    }
}

/// Counters for one consumer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub events_dispatched: u64,
    pub events_succeeded: u64,
    pub events_dead_lettered: u64,
    pub checkpoints_written: u64,
}

impl std::ops::AddAssign for ConsumerStats {
    fn add_assign(&mut self, other: Self) {
        self.events_dispatched += other.events_dispatched;
        self.events_succeeded += other.events_succeeded;
        self.events_dead_lettered += other.events_dead_lettered;
        self.checkpoints_written += other.checkpoints_written;
    }
}

/// Consumes one stream for one job.
///
/// Lifecycle: INIT (load checkpoint, open stream) -> STREAMING (one event at a
/// time: dispatch, then commit the checkpoint) -> STOPPED. Events are never
/// processed concurrently, so checkpoints only ever move forward in stream
/// order.
///
/// The checkpoint follows the cursor, not just dispatched events: entries the
/// filter drops and undecodable entries (dead-lettered without running the job)
/// move it too, and progress not yet committed is flushed when the consumer
/// stops.
pub struct StreamConsumer {
    source: Arc<dyn ChangeStreamSource>,
    checkpointer: Checkpointer,
    dispatcher: EventDispatcher,
    filter: StreamFilter,
    poison_policy: PoisonEventPolicy,
    state: ConsumerState,
    stats: ConsumerStats,
}

impl StreamConsumer {
    pub fn new(
        source: Arc<dyn ChangeStreamSource>,
        checkpointer: Checkpointer,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            source,
            checkpointer,
            dispatcher,
            filter: StreamFilter::default(),
            poison_policy: PoisonEventPolicy::default(),
            state: ConsumerState::Init,
            stats: ConsumerStats::default(),
        }
    }

    pub fn with_filter(mut self, filter: StreamFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_poison_policy(mut self, policy: PoisonEventPolicy) -> Self {
        self.poison_policy = policy;
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Run until the stream ends, is interrupted, or shutdown is requested.
    ///
    /// Shutdown is honored while waiting for the next event; an event already
    /// being dispatched finishes first, including its checkpoint write.
    pub async fn run(&mut self, shutdown: &mut ShutdownSignal) -> StopReason {
        self.state = ConsumerState::Init;
        let stream = self.checkpointer.stream().clone();
        let job = self.checkpointer.job().clone();

        let resume_after = match self.checkpointer.load().await {
            Ok(position) => position,
            Err(err) => return self.stop(StopReason::CheckpointUnavailable(err)),
        };
        match &resume_after {
            Some(position) => info!(%stream, %job, position = %position, "resuming change stream"),
            None => info!(%stream, %job, "no checkpoint; starting at the stream tail"),
        }

        let mut cursor = match self.source.open(&self.filter, resume_after.as_ref()).await {
            Ok(cursor) => cursor,
            Err(interruption) => return self.stop(StopReason::Interrupted(interruption)),
        };
        self.state = ConsumerState::Streaming;
        info!(%stream, %job, "listening for change events");

        let mut committed = resume_after;
        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => break StopReason::Shutdown,
                next = cursor.next_item() => next,
            };

            let item = match next {
                Ok(Some(item)) => item,
                Ok(None) => break StopReason::EndOfStream,
                Err(interruption) => break StopReason::Interrupted(interruption),
            };

            let poison = match item {
                CursorItem::Event(event) => {
                    debug!(event_id = %event.id(), operation = %event.operation_type(), "change event received");
                    let report = self.dispatcher.dispatch(&event).await;
                    self.stats.events_dispatched += 1;
                    if report.outcome.is_dead_lettered() {
                        self.stats.events_dead_lettered += 1;
                        Some(event.id().to_string())
                    } else {
                        self.stats.events_succeeded += 1;
                        None
                    }
                }
                CursorItem::Malformed(entry) => {
                    self.dispatcher.dead_letter_malformed(&entry).await;
                    self.stats.events_dead_lettered += 1;
                    Some(entry.id)
                }
                CursorItem::Skipped => None,
            };

            if let Some(event_id) = poison {
                if self.poison_policy == PoisonEventPolicy::Halt {
                    break StopReason::PoisonEvent {
                        event_id,
                        last_checkpoint: committed.clone(),
                    };
                }
            }

            if let Err(err) = self.commit_progress(cursor.resume_position(), &mut committed).await {
                break StopReason::CheckpointUnavailable(err);
            }
        };

        if matches!(
            reason,
            StopReason::EndOfStream | StopReason::Interrupted(_) | StopReason::Shutdown
        ) {
            if let Err(err) = self.commit_progress(cursor.resume_position(), &mut committed).await {
                warn!(error = %err, "could not flush checkpoint on stop");
            }
        }

        cursor.close().await;
        self.stop(reason)
    }

    /// Commit `position` if it is ahead of what was last committed.
    async fn commit_progress(
        &mut self,
        position: Option<ResumePosition>,
        committed: &mut Option<ResumePosition>,
    ) -> Result<(), CheckpointError> {
        let Some(position) = position else {
            return Ok(());
        };
        if committed.as_ref() == Some(&position) {
            return Ok(());
        }
        self.checkpointer.commit(&position).await?;
        self.stats.checkpoints_written += 1;
        *committed = Some(position);
        Ok(())
    }

    fn stop(&mut self, reason: StopReason) -> StopReason {
        self.state = ConsumerState::Stopped;
        info!(
            stream = %self.checkpointer.stream(),
            job = %self.checkpointer.job(),
            reason = %reason,
            dispatched = self.stats.events_dispatched,
            dead_lettered = self.stats.events_dead_lettered,
            "stream consumer stopped"
        );
        reason
    }
}

impl fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("checkpointer", &self.checkpointer)
            .field("dispatcher", &self.dispatcher)
            .field("filter", &self.filter)
            .field("poison_policy", &self.poison_policy)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
