//! Per-event job execution with local retry, backoff and dead-lettering.
//!
//! ## Components
//!
//! - `EventDispatcher`: drives one event to a terminal outcome
//! - `DispatchReport`/`JobAttempt`: in-memory record of the attempts made
//! - `JobKind`: the closed set of job variants a worker can be started with
//! - `AuditLogJob`, `PublishJob`: the concrete variants

pub mod auditlog;
pub mod dispatcher;
#[cfg(feature = "redis")]
pub mod publish;
pub mod registry;
pub mod types;

pub use auditlog::AuditLogJob;
pub use dispatcher::EventDispatcher;
#[cfg(feature = "redis")]
pub use publish::{EventPublisher, PublishJob};
pub use registry::JobKind;
pub use types::{AttemptOutcome, DispatchOutcome, DispatchReport, JobAttempt};
