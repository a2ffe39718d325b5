//! Redis Streams dead-letter sink.
//!
//! Each letter becomes one `XADD` entry on the dead-letter stream:
//! `id`, `stream`, `job`, `reason`, `error`, `attempts`, `dead_lettered_at` and
//! `event` (the full change event as JSON).

use async_trait::async_trait;
use tracing::instrument;

use changefeed_events::{DeadLetter, DeadLetterError, DeadLetterSink};

use crate::redis_client::RedisHandle;

pub const DEFAULT_DEAD_LETTER_STREAM: &str = "changefeed:dead-letters";

#[derive(Debug)]
pub struct RedisDeadLetterSink {
    redis: RedisHandle,
    stream_key: String,
}

impl RedisDeadLetterSink {
    /// Parses the URL only; the connection is opened on first publish.
    pub fn new(redis_url: &str, stream_key: impl Into<String>) -> Result<Self, DeadLetterError> {
        let redis =
            RedisHandle::open(redis_url).map_err(|e| DeadLetterError::Transport(e.to_string()))?;
        Ok(Self {
            redis,
            stream_key: stream_key.into(),
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterSink {
    #[instrument(
        skip(self, letter),
        fields(
            dlq_key = %self.stream_key,
            dead_letter_id = %letter.id,
            event_id = %letter.event.id()
        ),
        err
    )]
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let event = serde_json::to_string(&letter.event)
            .map_err(|e| DeadLetterError::Serialization(e.to_string()))?;

        let mut conn = self
            .redis
            .connection()
            .await
            .map_err(|e| DeadLetterError::Transport(e.to_string()))?;

        let added: redis::RedisResult<String> = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("id")
            .arg(letter.id.to_string())
            .arg("stream")
            .arg(letter.stream.as_str())
            .arg("job")
            .arg(letter.job.as_str())
            .arg("reason")
            .arg(letter.reason.as_str())
            .arg("error")
            .arg(&letter.error)
            .arg("attempts")
            .arg(letter.attempts)
            .arg("dead_lettered_at")
            .arg(letter.dead_lettered_at.to_rfc3339())
            .arg("event")
            .arg(&event)
            .query_async(&mut conn)
            .await;

        match added {
            Ok(_) => Ok(()),
            Err(err) => {
                self.redis.reset().await;
                Err(DeadLetterError::Transport(format!("XADD failed: {err}")))
            }
        }
    }
}
