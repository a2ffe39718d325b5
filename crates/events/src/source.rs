//! Resumable change-stream abstraction (mechanics only).
//!
//! A [`ChangeStreamSource`] opens a [`ChangeCursor`] positioned immediately after a
//! previously issued [`ResumePosition`] (or at the live tail when there is none).
//! The cursor yields items strictly in source order and exposes the position
//! reached after each yield, which is what the consumer checkpoints.
//!
//! Every entry the cursor consumes moves its position, including entries it
//! drops because they do not match the filter. Those are reported as
//! [`CursorItem::Skipped`] before the cursor waits for more, so the checkpoint
//! never lags behind history the source may later discard.
//!
//! ## Termination
//!
//! A cursor ends in one of two distinguishable ways:
//!
//! - `Ok(None)`: ordinary end of stream (the source was closed)
//! - `Err(StreamInterruption)`: the continuation marker became invalid or the
//!   transport was severed; the pipeline must be rebuilt from the last checkpoint
//!
//! ## Usage Pattern
//!
//! ```ignore
//! let mut cursor = source.open(&StreamFilter::default(), checkpoint.as_ref()).await?;
//! while let Some(item) = cursor.next_item().await? {
//!     match item {
//!         CursorItem::Event(event) => dispatch(&event).await,
//!         CursorItem::Malformed(entry) => dead_letter(&entry).await,
//!         CursorItem::Skipped => {}
//!     }
//!     save(cursor.resume_position()).await;
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use changefeed_core::{ChangeEvent, OperationType, ResumePosition};

/// Why a cursor could not continue.
///
/// This is the only failure that crosses the consumer/supervisor boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamInterruption {
    /// The resume position is stale, unrelated to this stream, or was invalidated.
    #[error("resume position invalidated: {0}")]
    Invalidated(String),

    /// Connection lost or a stream command failed.
    #[error("stream transport failed: {0}")]
    Transport(String),
}

impl StreamInterruption {
    pub fn invalidated(msg: impl Into<String>) -> Self {
        Self::Invalidated(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

pub type StreamResult<T> = Result<T, StreamInterruption>;

/// Subscription filter applied on the source side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFilter {
    operations: Vec<OperationType>,
}

impl Default for StreamFilter {
    /// Inserts, updates and replaces; deletes are excluded.
    fn default() -> Self {
        Self {
            operations: OperationType::DISPATCHABLE.to_vec(),
        }
    }
}

impl StreamFilter {
    pub fn new(operations: impl IntoIterator<Item = OperationType>) -> Self {
        Self {
            operations: operations.into_iter().collect(),
        }
    }

    pub fn operations(&self) -> &[OperationType] {
        &self.operations
    }

    pub fn matches(&self, operation: OperationType) -> bool {
        self.operations.contains(&operation)
    }
}

/// Stream entry that could not be decoded into a change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalformedEntry {
    /// Stream-assigned entry id.
    pub id: String,
    pub reason: String,
    /// Raw entry fields, as far as they could be read.
    pub fields: JsonValue,
}

impl MalformedEntry {
    pub fn new(id: impl Into<String>, reason: impl Into<String>, fields: JsonValue) -> Self {
        Self {
            id: id.into(),
            reason: reason.into(),
            fields,
        }
    }
}

/// One step of a cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorItem {
    /// A change event matching the filter.
    Event(ChangeEvent),
    /// An entry that could not be decoded; it is dead-lettered, never dropped.
    Malformed(MalformedEntry),
    /// Entries were consumed without yielding anything (filtered out); the
    /// resume position moved past them.
    Skipped,
}

/// Open handle over a change stream.
///
/// Cursors are consumed by a single task; one event is fully handled before the
/// next is requested.
#[async_trait]
pub trait ChangeCursor: Send {
    /// Wait for the next item.
    ///
    /// Returns [`CursorItem::Skipped`] instead of waiting when entries were
    /// filtered out since the last item.
    async fn next_item(&mut self) -> StreamResult<Option<CursorItem>>;

    /// Position immediately after the most recently consumed entry.
    ///
    /// `None` until the first item has been yielded.
    fn resume_position(&self) -> Option<ResumePosition>;

    /// Release the underlying handle. Idempotent.
    async fn close(&mut self) {}
}

/// Factory for cursors over one stream.
#[async_trait]
pub trait ChangeStreamSource: Send + Sync {
    /// Open a cursor delivering events after `resume_after`, or from the live tail.
    async fn open(
        &self,
        filter: &StreamFilter,
        resume_after: Option<&ResumePosition>,
    ) -> StreamResult<Box<dyn ChangeCursor>>;
}

#[async_trait]
impl<S> ChangeStreamSource for Arc<S>
where
    S: ChangeStreamSource + ?Sized,
{
    async fn open(
        &self,
        filter: &StreamFilter,
        resume_after: Option<&ResumePosition>,
    ) -> StreamResult<Box<dyn ChangeCursor>> {
        (**self).open(filter, resume_after).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_excludes_deletes() {
        let filter = StreamFilter::default();
        assert!(filter.matches(OperationType::Insert));
        assert!(filter.matches(OperationType::Update));
        assert!(filter.matches(OperationType::Replace));
        assert!(!filter.matches(OperationType::Delete));
    }

    #[test]
    fn custom_filter_only_matches_listed_operations() {
        let filter = StreamFilter::new([OperationType::Insert]);
        assert_eq!(filter.operations(), &[OperationType::Insert]);
        assert!(!filter.matches(OperationType::Update));
    }
}
