//! Redis Streams change source.
//!
//! Every watched collection is one Redis stream whose entries are change
//! records written upstream:
//!
//! | field           | content                                     |
//! |-----------------|---------------------------------------------|
//! | `op`            | `insert`, `update`, `replace` or `delete`   |
//! | `ns`            | namespace (defaults to the stream key)      |
//! | `document_key`  | JSON                                        |
//! | `full_document` | JSON                                        |
//!
//! ## Positions
//!
//! Entry IDs (`<ms>-<seq>`) are the resume positions. A cursor opened after
//! position `p` reads with `XREAD ... STREAMS key p`, so it sees exactly the
//! entries appended after `p`.
//!
//! A position is rejected as [`StreamInterruption::Invalidated`] when:
//! - it is not an entry ID at all
//! - it is ahead of the last ID the stream generated (issued elsewhere)
//! - history after it is gone: the oldest retained entry is newer than the
//!   position (or the stream is empty) and, on Redis 7+, `max-deleted-entry-id`
//!   confirms an entry after the position was deleted
//!
//! ## Entries
//!
//! Every entry read moves the cursor position. Entries dropped by the filter
//! are reported as [`CursorItem::Skipped`] before the next `XREAD`; entries
//! that cannot be decoded are yielded as [`CursorItem::Malformed`] with their
//! raw fields.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use redis::{Client, FromRedisValue, RedisError, Value};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use changefeed_core::{ChangeEvent, OperationType, ResumePosition};
use changefeed_events::{
    ChangeCursor, ChangeStreamSource, CursorItem, MalformedEntry, StreamFilter, StreamInterruption,
    StreamResult,
};

pub const DEFAULT_BLOCK: Duration = Duration::from_millis(5000);
pub const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedisStreamOptions {
    /// How long one `XREAD` waits for new entries before polling again.
    pub block: Duration,
    /// Entries fetched per `XREAD`.
    pub batch_size: usize,
}

impl Default for RedisStreamOptions {
    fn default() -> Self {
        Self {
            block: DEFAULT_BLOCK,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Stream entry ID, ordered like Redis orders them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl EntryId {
    const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    fn parse(raw: &str) -> Option<Self> {
        let (ms, seq) = raw.split_once('-')?;
        Some(Self {
            ms: ms.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Change source over one Redis stream key.
///
/// Every [`open`](ChangeStreamSource::open) establishes a fresh connection, so a
/// rebuilt pipeline never inherits a broken one.
#[derive(Debug, Clone)]
pub struct RedisChangeStream {
    client: Client,
    key: String,
    options: RedisStreamOptions,
}

impl RedisChangeStream {
    pub fn new(
        redis_url: &str,
        key: impl Into<String>,
        options: RedisStreamOptions,
    ) -> StreamResult<Self> {
        let client = Client::open(redis_url).map_err(transport)?;
        Ok(Self {
            client,
            key: key.into(),
            options,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the stream key exists.
    pub async fn exists(&self) -> StreamResult<bool> {
        let mut conn = self.connect().await?;
        redis::cmd("EXISTS")
            .arg(&self.key)
            .query_async::<_, bool>(&mut conn)
            .await
            .map_err(transport)
    }

    async fn connect(&self) -> StreamResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(transport)
    }

    async fn last_entry(&self, conn: &mut MultiplexedConnection) -> StreamResult<Option<EntryId>> {
        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(&self.key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(transport)?;
        reply.ids.first().map(|entry| parse_reply_id(&entry.id)).transpose()
    }

    async fn first_entry(&self, conn: &mut MultiplexedConnection) -> StreamResult<Option<EntryId>> {
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(transport)?;
        reply.ids.first().map(|entry| parse_reply_id(&entry.id)).transpose()
    }

    /// `max-deleted-entry-id` from `XINFO STREAM` (Redis 7+ only).
    async fn max_deleted(&self, conn: &mut MultiplexedConnection) -> StreamResult<Option<EntryId>> {
        let info: HashMap<String, Value> = redis::cmd("XINFO")
            .arg("STREAM")
            .arg(&self.key)
            .query_async(conn)
            .await
            .map_err(transport)?;
        Ok(info
            .get("max-deleted-entry-id")
            .and_then(|value| String::from_redis_value(value).ok())
            .and_then(|raw| EntryId::parse(&raw)))
    }

    async fn validate_position(
        &self,
        conn: &mut MultiplexedConnection,
        position: &ResumePosition,
    ) -> StreamResult<EntryId> {
        let id = EntryId::parse(position.as_str()).ok_or_else(|| {
            StreamInterruption::invalidated(format!("position {position} is not a stream entry id"))
        })?;

        if let Some(last) = self.last_entry(conn).await? {
            if id > last {
                return Err(StreamInterruption::invalidated(format!(
                    "position {position} is ahead of the newest entry {last} of {}",
                    self.key
                )));
            }
        }

        let first = self.first_entry(conn).await?;
        let max_deleted = self.max_deleted(conn).await?;
        if history_lost(id, first, max_deleted) {
            return Err(StreamInterruption::invalidated(format!(
                "entries after position {position} are no longer retained in {}",
                self.key
            )));
        }

        Ok(id)
    }
}

#[async_trait]
impl ChangeStreamSource for RedisChangeStream {
    #[instrument(skip(self, filter), fields(stream_key = %self.key), err)]
    async fn open(
        &self,
        filter: &StreamFilter,
        resume_after: Option<&ResumePosition>,
    ) -> StreamResult<Box<dyn ChangeCursor>> {
        let mut conn = self.connect().await?;

        let start = match resume_after {
            Some(position) => self.validate_position(&mut conn, position).await?,
            None => self.last_entry(&mut conn).await?.unwrap_or(EntryId::ZERO),
        };
        debug!(start = %start, resumed = resume_after.is_some(), "opened change stream");

        Ok(Box::new(RedisCursor {
            conn,
            key: self.key.clone(),
            filter: filter.clone(),
            options: self.options,
            last_read: start.to_string(),
            buffer: VecDeque::new(),
            position: resume_after.cloned(),
            closed: false,
        }))
    }
}

struct RedisCursor {
    conn: MultiplexedConnection,
    key: String,
    filter: StreamFilter,
    options: RedisStreamOptions,
    /// ID passed to the next `XREAD`.
    last_read: String,
    buffer: VecDeque<StreamId>,
    position: Option<ResumePosition>,
    closed: bool,
}

impl RedisCursor {
    async fn fill(&mut self) -> StreamResult<()> {
        let block_ms = u64::try_from(self.options.block.as_millis()).unwrap_or(u64::MAX);
        let reply: Option<StreamReadReply> = redis::cmd("XREAD")
            .arg("COUNT")
            .arg(self.options.batch_size)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.key)
            .arg(&self.last_read)
            .query_async(&mut self.conn)
            .await
            .map_err(transport)?;

        // `None` means the block timed out without new entries.
        for stream in reply.into_iter().flat_map(|r| r.keys) {
            for entry in stream.ids {
                self.last_read = entry.id.clone();
                self.buffer.push_back(entry);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeCursor for RedisCursor {
    async fn next_item(&mut self) -> StreamResult<Option<CursorItem>> {
        loop {
            if self.closed {
                return Ok(None);
            }

            let mut skipped = false;
            while let Some(entry) = self.buffer.pop_front() {
                self.position = Some(ResumePosition::new(entry.id.as_str()));
                match decode_entry(&entry, &self.key) {
                    Ok(event) if self.filter.matches(event.operation_type()) => {
                        return Ok(Some(CursorItem::Event(event)));
                    }
                    Ok(_) => skipped = true,
                    Err(reason) => {
                        warn!(stream_key = %self.key, entry_id = %entry.id, %reason, "undecodable stream entry");
                        return Ok(Some(CursorItem::Malformed(malformed_entry(&entry, reason))));
                    }
                }
            }
            if skipped {
                return Ok(Some(CursorItem::Skipped));
            }

            self.fill().await?;
        }
    }

    fn resume_position(&self) -> Option<ResumePosition> {
        self.position.clone()
    }

    async fn close(&mut self) {
        self.closed = true;
        self.buffer.clear();
    }
}

fn transport(err: RedisError) -> StreamInterruption {
    StreamInterruption::transport(err.to_string())
}

fn parse_reply_id(raw: &str) -> StreamResult<EntryId> {
    EntryId::parse(raw)
        .ok_or_else(|| StreamInterruption::transport(format!("server returned malformed entry id {raw:?}")))
}

/// Whether history after `id` is gone.
///
/// `XDEL` of a single entry also moves `max-deleted-entry-id`, so that alone is
/// not enough: the oldest retained entry must be newer than `id` too. Without
/// `max-deleted-entry-id` (before Redis 7) the oldest entry decides, which may
/// flag a position exactly at a trim boundary.
fn history_lost(id: EntryId, first: Option<EntryId>, max_deleted: Option<EntryId>) -> bool {
    let oldest_is_newer = first.is_none_or(|first| first > id);
    match max_deleted {
        Some(max_deleted) => max_deleted > id && oldest_is_newer,
        None => first.is_some_and(|first| first > id),
    }
}

fn malformed_entry(entry: &StreamId, reason: String) -> MalformedEntry {
    let fields = entry
        .map
        .iter()
        .map(|(name, value)| {
            let text = String::from_redis_value(value).unwrap_or_else(|_| format!("{value:?}"));
            (name.clone(), JsonValue::String(text))
        })
        .collect::<serde_json::Map<_, _>>();
    MalformedEntry::new(entry.id.as_str(), reason, JsonValue::Object(fields))
}

/// Decode one stream entry into a change event.
fn decode_entry(entry: &StreamId, default_namespace: &str) -> Result<ChangeEvent, String> {
    let op: String = entry.get("op").ok_or("missing `op` field")?;
    let operation: OperationType = op.parse().map_err(|e| format!("{e}"))?;
    let namespace: String = entry
        .get("ns")
        .unwrap_or_else(|| default_namespace.to_string());

    Ok(ChangeEvent::new(
        entry.id.clone(),
        operation,
        json_field(entry, "full_document"),
        namespace,
        json_field(entry, "document_key"),
    ))
}

/// Missing fields decode as `null`; non-JSON text is kept as a string.
fn json_field(entry: &StreamId, name: &str) -> JsonValue {
    match entry.get::<String>(name) {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(_) => JsonValue::String(raw),
        },
        None => JsonValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: id.to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), Value::Data(v.as_bytes().to_vec())))
                .collect(),
        }
    }

    #[test]
    fn entry_ids_order_numerically() {
        let a = EntryId::parse("1700000000000-9").unwrap();
        let b = EntryId::parse("1700000000000-10").unwrap();
        let c = EntryId::parse("1700000000001-0").unwrap();
        assert!(a < b && b < c);
        assert_eq!(b.to_string(), "1700000000000-10");
        assert!(EntryId::parse("mem:3").is_none());
        assert!(EntryId::parse("17-x").is_none());
    }

    #[test]
    fn decodes_change_record_fields() {
        let raw = entry(
            "5-0",
            &[
                ("op", "update"),
                ("ns", "blog.posts"),
                ("document_key", r#"{"_id": "p1"}"#),
                ("full_document", r#"{"_id": "p1", "title": "hi"}"#),
            ],
        );

        let event = decode_entry(&raw, "posts").unwrap();
        assert_eq!(event.id(), "5-0");
        assert_eq!(event.operation_type(), OperationType::Update);
        assert_eq!(event.namespace(), "blog.posts");
        assert_eq!(event.resource_document(), &json!({"_id": "p1", "title": "hi"}));
        assert_eq!(event.document_key(), &json!({"_id": "p1"}));
    }

    #[test]
    fn decoding_is_lenient_about_payload_fields() {
        let raw = entry("6-0", &[("op", "insert"), ("full_document", "not json")]);

        let event = decode_entry(&raw, "posts").unwrap();
        assert_eq!(event.namespace(), "posts");
        assert_eq!(event.resource_document(), &json!("not json"));
        assert_eq!(event.document_key(), &JsonValue::Null);
    }

    #[test]
    fn entries_without_known_operation_are_rejected() {
        assert!(decode_entry(&entry("7-0", &[]), "posts").is_err());
        assert!(decode_entry(&entry("7-1", &[("op", "drop")]), "posts").is_err());
    }

    #[test]
    fn undecodable_entries_keep_raw_fields() {
        let raw = entry("7-1", &[("op", "drop"), ("ns", "posts")]);
        let reason = decode_entry(&raw, "posts").unwrap_err();

        let malformed = malformed_entry(&raw, reason);
        assert_eq!(malformed.id, "7-1");
        assert!(malformed.reason.contains("drop"));
        assert_eq!(malformed.fields, json!({"op": "drop", "ns": "posts"}));
    }

    fn id(raw: &str) -> EntryId {
        EntryId::parse(raw).unwrap()
    }

    #[test]
    fn trimmed_history_is_lost() {
        // Trimmed through 6-0 while the checkpoint sits at 5-0.
        assert!(history_lost(id("5-0"), Some(id("7-0")), Some(id("6-0"))));
        // Trimmed down to nothing.
        assert!(history_lost(id("5-0"), None, Some(id("9-0"))));
        // Pre-7 servers only see the oldest entry.
        assert!(history_lost(id("5-0"), Some(id("6-0")), None));
    }

    #[test]
    fn deleting_a_single_unconsumed_entry_keeps_position_valid() {
        // XDEL 7-0 with older entries still retained.
        assert!(!history_lost(id("5-0"), Some(id("1-0")), Some(id("7-0"))));
        // Only entries up to the checkpoint were trimmed.
        assert!(!history_lost(id("5-0"), Some(id("6-0")), Some(id("5-0"))));
        assert!(!history_lost(id("5-0"), Some(id("5-0")), None));
        assert!(!history_lost(id("0-0"), None, None));
    }
}
