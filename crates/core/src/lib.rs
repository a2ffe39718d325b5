//! `changefeed-core`: primitives shared by every layer of the change-stream engine.
//!
//! This crate contains **pure** types (no IO, no async): stream/job names, the
//! change event envelope and the opaque resume position issued by a stream source.

pub mod error;
pub mod event;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use event::{render_id, ChangeEvent, OperationType, ResumePosition};
pub use id::{JobName, StreamName};
