//! Supervisor: keeps a stream consumer alive across interruptions.
//!
//! Each run builds a fresh pipeline (source, checkpoint store, dead-letter
//! sink) through a [`PipelineFactory`], runs a [`StreamConsumer`] over it and,
//! when the consumer stops for a recoverable reason, waits out the
//! pipeline-restart backoff and starts over from the last checkpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{Instrument, error, info, info_span, warn};

use changefeed_core::{JobName, ResumePosition, StreamName};
use changefeed_events::{ChangeStreamSource, DeadLetterSink, Job, StreamFilter};

use super::consumer::{ConsumerStats, StopReason, StreamConsumer};
use super::shutdown::{ShutdownSignal, shutdown_requested};
use crate::checkpoint::{CheckpointStore, Checkpointer};
use crate::config::PoisonEventPolicy;
use crate::jobs::EventDispatcher;
use crate::retry::{RetryDecision, RetryPolicy};

/// External dependencies of one consumer run.
#[derive(Clone)]
pub struct Pipeline {
    pub source: Arc<dyn ChangeStreamSource>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

impl core::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    /// Misconfiguration or a missing resource; retrying cannot help.
    #[error("fatal setup failure: {0}")]
    Fatal(String),

    /// A dependency is temporarily unreachable.
    #[error("transient setup failure: {0}")]
    Transient(String),
}

/// Builds the dependencies for one consumer run.
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    async fn build(&self) -> Result<Pipeline, BuildError>;
}

#[async_trait]
impl<F> PipelineFactory for Arc<F>
where
    F: PipelineFactory + ?Sized,
{
    async fn build(&self) -> Result<Pipeline, BuildError> {
        (**self).build().await
    }
}

/// Factory handing out the same pipeline every time (tests/dev).
///
/// Build failures can be scripted to exercise rebuild handling.
#[derive(Debug)]
pub struct StaticPipelineFactory {
    pipeline: Pipeline,
    failures: Mutex<VecDeque<BuildError>>,
    builds: AtomicU32,
}

impl StaticPipelineFactory {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            failures: Mutex::new(VecDeque::new()),
            builds: AtomicU32::new(0),
        }
    }

    /// Fail the next build with `err` (queued in call order).
    pub fn fail_next_build(&self, err: BuildError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(err);
        }
    }

    /// Build calls, including failed ones.
    pub fn builds(&self) -> u32 {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineFactory for StaticPipelineFactory {
    async fn build(&self) -> Result<Pipeline, BuildError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let failure = self.failures.lock().ok().and_then(|mut f| f.pop_front());
        match failure {
            Some(err) => Err(err),
            None => Ok(self.pipeline.clone()),
        }
    }
}

/// Clean end of supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorExit {
    /// Pipeline rebuilds performed.
    pub restarts: u32,
    /// Totals across every consumer run.
    pub stats: ConsumerStats,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("pipeline setup failed: {0}")]
    Setup(BuildError),

    #[error("halted on poison event {event_id}")]
    PoisonEvent {
        event_id: String,
        last_checkpoint: Option<ResumePosition>,
    },

    #[error("gave up after {restarts} restarts; last failure: {last_failure}")]
    RestartsExhausted { restarts: u32, last_failure: String },
}

/// Runs a stream consumer forever, rebuilding it after interruptions.
///
/// - The first build failing is fatal (startup misconfiguration)
/// - Later transient build failures and recoverable consumer stops are retried
///   under the pipeline-restart policy (unbounded by default)
/// - The restart backoff resets after any run that dispatched an event
/// - A shutdown request ends supervision cleanly, including during backoff
pub struct Supervisor<F> {
    factory: F,
    stream: StreamName,
    job_name: JobName,
    job: Arc<dyn Job>,
    filter: StreamFilter,
    poison_policy: PoisonEventPolicy,
    restart_policy: RetryPolicy,
    job_policy: RetryPolicy,
    io_policy: RetryPolicy,
}

impl<F: PipelineFactory> Supervisor<F> {
    pub fn new(factory: F, stream: StreamName, job_name: JobName, job: Arc<dyn Job>) -> Self {
        Self {
            factory,
            stream,
            job_name,
            job,
            filter: StreamFilter::default(),
            poison_policy: PoisonEventPolicy::default(),
            restart_policy: RetryPolicy::pipeline_restart(),
            job_policy: RetryPolicy::job_local(),
            io_policy: RetryPolicy::checkpoint_io(),
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

    pub fn with_restart_policy(mut self, policy: RetryPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_job_policy(mut self, policy: RetryPolicy) -> Self {
        self.job_policy = policy;
        self
    }

    pub fn with_io_policy(mut self, policy: RetryPolicy) -> Self {
        self.io_policy = policy;
        self
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<SupervisorExit, SupervisorError> {
        let mut exit = SupervisorExit {
            restarts: 0,
            stats: ConsumerStats::default(),
        };
        let mut attempt = 0;
        let mut first_build = true;

        loop {
            if *shutdown.borrow() {
                return Ok(exit);
            }

            let pipeline = match self.factory.build().await {
                Ok(pipeline) => pipeline,
                Err(err) if first_build || matches!(err, BuildError::Fatal(_)) => {
                    error!(stream = %self.stream, job = %self.job_name, error = %err, "pipeline setup failed");
                    return Err(SupervisorError::Setup(err));
                }
                Err(err) => {
                    attempt += 1;
                    exit.restarts += 1;
                    warn!(stream = %self.stream, job = %self.job_name, attempt, error = %err, "pipeline rebuild failed");
                    if !self.backoff(attempt, &mut shutdown, exit.restarts, &err.to_string()).await? {
                        return Ok(exit);
                    }
                    continue;
                }
            };
            first_build = false;

            let span = info_span!(
                "pipeline",
                stream = %self.stream,
                job = %self.job_name,
                generation = exit.restarts
            );
            let mut consumer = self.consumer(pipeline);
            let reason = consumer.run(&mut shutdown).instrument(span).await;
            let stats = consumer.stats();
            exit.stats += stats;

            match reason {
                StopReason::Shutdown => return Ok(exit),
                StopReason::PoisonEvent {
                    event_id,
                    last_checkpoint,
                } => {
                    error!(stream = %self.stream, job = %self.job_name, %event_id, "halting on poison event");
                    return Err(SupervisorError::PoisonEvent {
                        event_id,
                        last_checkpoint,
                    });
                }
                other => {
                    if stats.events_dispatched > 0 {
                        attempt = 0;
                    }
                    attempt += 1;
                    exit.restarts += 1;
                    warn!(
                        stream = %self.stream,
                        job = %self.job_name,
                        attempt,
                        reason = %other,
                        "change stream stopped; restarting from last checkpoint"
                    );
                    if !self.backoff(attempt, &mut shutdown, exit.restarts, &other.to_string()).await? {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    fn consumer(&self, pipeline: Pipeline) -> StreamConsumer {
        let checkpointer =
            Checkpointer::new(pipeline.checkpoints, self.stream.clone(), self.job_name.clone())
                .with_policy(self.io_policy);
        let dispatcher = EventDispatcher::new(
            self.stream.clone(),
            self.job_name.clone(),
            self.job.clone(),
            pipeline.dead_letters,
        )
        .with_job_policy(self.job_policy)
        .with_io_policy(self.io_policy);

        StreamConsumer::new(pipeline.source, checkpointer, dispatcher)
            .with_filter(self.filter.clone())
            .with_poison_policy(self.poison_policy)
    }

    /// Sleep before restart `attempt`. `Ok(false)` when shutdown interrupted it.
    async fn backoff(
        &self,
        attempt: u32,
        shutdown: &mut ShutdownSignal,
        restarts: u32,
        last_failure: &str,
    ) -> Result<bool, SupervisorError> {
        match self.restart_policy.decide(attempt) {
            RetryDecision::Wait(delay) => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "waiting before pipeline restart");
                tokio::select! {
                    biased;
                    _ = shutdown_requested(shutdown) => Ok(false),
                    _ = tokio::time::sleep(delay) => Ok(true),
                }
            }
            RetryDecision::GiveUp => Err(SupervisorError::RestartsExhausted {
                restarts,
                last_failure: last_failure.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::workers::shutdown::shutdown_channel;
    use changefeed_core::{ChangeEvent, OperationType};
    use changefeed_events::{InMemoryChangeStream, InMemoryDeadLetterSink, ScriptedJob, StreamInterruption};
    use serde_json::json;

    fn pipeline(stream: &InMemoryChangeStream) -> Pipeline {
        Pipeline {
            source: Arc::new(stream.clone()),
            checkpoints: InMemoryCheckpointStore::arc(),
            dead_letters: InMemoryDeadLetterSink::arc(),
        }
    }

    fn supervisor(factory: Arc<StaticPipelineFactory>) -> Supervisor<Arc<StaticPipelineFactory>> {
        Supervisor::new(
            factory,
            StreamName::new("posts").unwrap(),
            JobName::new("auditlogs").unwrap(),
            Arc::new(ScriptedJob::new("auditlogs")),
        )
    }

    async fn wait_for_builds(factory: &StaticPipelineFactory, builds: u32) {
        while factory.builds() < builds {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_build_failure_is_fatal() {
        let factory = Arc::new(StaticPipelineFactory::new(pipeline(&InMemoryChangeStream::new())));
        factory.fail_next_build(BuildError::Transient("redis down".into()));
        let (_trigger, signal) = shutdown_channel();

        let result = supervisor(factory.clone()).run(signal).await;

        assert_eq!(
            result,
            Err(SupervisorError::Setup(BuildError::Transient("redis down".into())))
        );
        assert_eq!(factory.builds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_rebuild_failures_are_retried() {
        let stream = InMemoryChangeStream::new();
        let factory = Arc::new(StaticPipelineFactory::new(pipeline(&stream)));
        let (trigger, signal) = shutdown_channel();
        let sup = supervisor(factory.clone());

        let handle = tokio::spawn(async move { sup.run(signal).await });
        wait_for_builds(&factory, 1).await;
        factory.fail_next_build(BuildError::Transient("postgres down".into()));
        factory.fail_next_build(BuildError::Transient("postgres down".into()));
        while stream.opens() < 3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        trigger.trigger();

        let exit = handle.await.unwrap().unwrap();
        assert!(factory.builds() >= 5);
        assert!(exit.restarts >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_rebuild_failure_ends_supervision() {
        let factory = Arc::new(StaticPipelineFactory::new(pipeline(&InMemoryChangeStream::new())));
        let (_trigger, signal) = shutdown_channel();
        let sup = supervisor(factory.clone());

        let handle = tokio::spawn(async move { sup.run(signal).await });
        wait_for_builds(&factory, 1).await;
        factory.fail_next_build(BuildError::Fatal("stream deleted".into()));

        let result = handle.await.unwrap();
        assert_eq!(
            result,
            Err(SupervisorError::Setup(BuildError::Fatal("stream deleted".into())))
        );
        assert!(factory.builds() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_supervision_cleanly() {
        let factory = Arc::new(StaticPipelineFactory::new(pipeline(&InMemoryChangeStream::new())));
        let (trigger, signal) = shutdown_channel();
        let sup = supervisor(factory.clone());

        let handle = tokio::spawn(async move { sup.run(signal).await });
        wait_for_builds(&factory, 1).await;
        trigger.trigger();

        let exit = handle.await.unwrap().unwrap();
        assert_eq!(exit.stats, ConsumerStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_restart_policy_gives_up() {
        let factory = Arc::new(StaticPipelineFactory::new(pipeline(&InMemoryChangeStream::new())));
        let (_trigger, signal) = shutdown_channel();

        let result = supervisor(factory)
            .with_restart_policy(RetryPolicy::pipeline_restart().with_max_attempts(Some(3)))
            .run(signal)
            .await;

        assert!(matches!(
            result,
            Err(SupervisorError::RestartsExhausted { restarts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_attempts_reset_after_productive_run() {
        let stream = InMemoryChangeStream::new();
        stream.append(ChangeEvent::new("e1", OperationType::Insert, json!({}), "posts", json!({"_id": 1})));
        stream.fail_next_open(StreamInterruption::transport("connection refused"));

        let checkpoints = InMemoryCheckpointStore::arc();
        let posts = StreamName::new("posts").unwrap();
        let auditlogs = JobName::new("auditlogs").unwrap();
        checkpoints
            .set(&posts, &auditlogs, &InMemoryChangeStream::position(0))
            .await
            .unwrap();
        let factory = Arc::new(StaticPipelineFactory::new(Pipeline {
            source: Arc::new(stream.clone()),
            checkpoints,
            dead_letters: InMemoryDeadLetterSink::arc(),
        }));
        let (_trigger, signal) = shutdown_channel();

        // run 1: open fails (attempt 1), run 2: dispatches e1 (reset, attempt 1),
        // run 3: nothing new (attempt 2, gives up).
        let result = supervisor(factory)
            .with_restart_policy(RetryPolicy::pipeline_restart().with_max_attempts(Some(2)))
            .run(signal)
            .await;

        assert!(matches!(
            result,
            Err(SupervisorError::RestartsExhausted { restarts: 3, .. })
        ));
        assert_eq!(stream.opens(), 2);
    }
}
