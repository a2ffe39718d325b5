//! Change-stream sources.
//!
//! The contract lives in `changefeed_events::source`; this module provides the
//! Redis Streams implementation used in production.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisChangeStream, RedisStreamOptions};

pub use changefeed_events::{
    ChangeCursor, ChangeStreamSource, CursorItem, InMemoryChangeStream, MalformedEntry, StreamFilter,
    StreamInterruption,
};
