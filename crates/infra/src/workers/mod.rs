//! Long-running workers: the stream consumer and the supervisor that keeps it
//! alive.

pub mod consumer;
pub mod shutdown;
pub mod supervisor;

pub use consumer::{ConsumerState, ConsumerStats, StopReason, StreamConsumer};
pub use shutdown::{ShutdownSignal, ShutdownTrigger, shutdown_channel, shutdown_requested};
pub use supervisor::{
    BuildError, Pipeline, PipelineFactory, StaticPipelineFactory, Supervisor, SupervisorError,
    SupervisorExit,
};
