//! Infrastructure layer: the resumable consumption and retry-orchestration engine.
//!
//! ```text
//! Supervisor ─builds─▶ StreamConsumer ─next event─▶ EventDispatcher ─▶ Job
//!     ▲                    │                              │
//!     │ StopReason         ▼                              ▼
//!     └──────────── Checkpointer (Postgres)        DeadLetterSink (Redis)
//! ```
//!
//! Three independently configured [`RetryPolicy`] tiers govern checkpoint I/O,
//! per-event job retries and whole-pipeline restarts.

pub mod checkpoint;
pub mod config;
pub mod dead_letter;
pub mod jobs;
#[cfg(feature = "redis")]
pub mod redis_client;
pub mod retry;
pub mod stream;
pub mod workers;


pub use checkpoint::{
    CheckpointError, CheckpointStore, Checkpointer, InMemoryCheckpointStore, PostgresCheckpointStore,
};
pub use config::{ConfigError, PoisonEventPolicy, WorkerConfig};
pub use dead_letter::publish_with_retry;
#[cfg(feature = "redis")]
pub use dead_letter::RedisDeadLetterSink;
pub use jobs::{
    AttemptOutcome, AuditLogJob, DispatchOutcome, DispatchReport, EventDispatcher, JobAttempt, JobKind,
};
#[cfg(feature = "redis")]
pub use jobs::{EventPublisher, PublishJob};
pub use retry::{RetryDecision, RetryPolicy};
#[cfg(feature = "redis")]
pub use stream::{RedisChangeStream, RedisStreamOptions};
pub use workers::{
    BuildError, ConsumerState, ConsumerStats, Pipeline, PipelineFactory, ShutdownSignal,
    ShutdownTrigger, StaticPipelineFactory, StopReason, StreamConsumer, Supervisor, SupervisorError,
    SupervisorExit, shutdown_channel,
};
