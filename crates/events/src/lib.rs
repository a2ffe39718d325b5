//! Change-stream mechanics and the collaborator contracts the engine drives.
//!
//! - [`source`]: resumable stream source and cursor abstraction
//! - [`job`]: the per-event job contract with explicit failure classification
//! - [`dead_letter`]: the sink for events that could not be processed
//!
//! In-memory implementations live next to the contracts for tests/dev.

pub mod dead_letter;
pub mod in_memory;
pub mod job;
pub mod source;

pub use dead_letter::{
    DeadLetter, DeadLetterError, DeadLetterPayload, DeadLetterReason, DeadLetterSink,
    InMemoryDeadLetterSink,
};
pub use in_memory::InMemoryChangeStream;
pub use job::{Job, JobContext, JobError, ScriptedJob};
pub use source::{
    ChangeCursor, ChangeStreamSource, CursorItem, MalformedEntry, StreamFilter, StreamInterruption,
    StreamResult,
};
