//! Publish job: forwards audit-log records as CloudEvents-shaped entries to a
//! per-collection Redis stream topic, where subscribers pick them up.
//!
//! Naming, for collection `blog_posts_auditlogs` and operation `update`:
//! - type: `blog-posts.update`
//! - source (topic): `db-blog-posts-events`

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use changefeed_core::{ChangeEvent, StreamName, render_id};
use changefeed_events::{Job, JobContext, JobError};

use crate::redis_client::RedisHandle;

pub const JOB_NAME: &str = "publish";
pub const SPEC_VERSION: &str = "1.0";
pub const CONTENT_TYPE: &str = "application/json";

/// Collection name without its last `_suffix`, underscores turned into dashes.
fn collection_stem(collection: &str) -> String {
    collection
        .rsplit_once('_')
        .map_or(collection, |(stem, _)| stem)
        .replace('_', "-")
}

/// Event type: `<stem>.<operation_type>`.
pub fn event_type(collection: &str, operation_type: &str) -> String {
    format!("{}.{}", collection_stem(collection), operation_type)
}

/// Event source, which is also the topic stream key: `<prefix><stem>-events`.
pub fn event_source(prefix: &str, collection: &str) -> String {
    format!("{prefix}{}-events", collection_stem(collection))
}

/// Handle used to publish events to topic streams.
///
/// Construction parses the Redis URL and does no I/O. The first publish opens
/// one multiplexed connection that later publishes reuse; after a transport
/// error the next publish reconnects.
#[derive(Debug)]
pub struct EventPublisher {
    redis: RedisHandle,
}

impl EventPublisher {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            redis: RedisHandle::open(redis_url)?,
        })
    }

    /// Append one CloudEvents-shaped entry to the `source` stream.
    pub async fn publish(
        &self,
        event_type: &str,
        source: &str,
        data: &serde_json::Value,
    ) -> Result<String, redis::RedisError> {
        let data = data.to_string();
        let mut conn = self.redis.connection().await?;

        let result = redis::cmd("XADD")
            .arg(source)
            .arg("*")
            .arg("id")
            .arg(Uuid::now_v7().to_string())
            .arg("specversion")
            .arg(SPEC_VERSION)
            .arg("type")
            .arg(event_type)
            .arg("source")
            .arg(source)
            .arg("time")
            .arg(Utc::now().to_rfc3339())
            .arg("datacontenttype")
            .arg(CONTENT_TYPE)
            .arg("data")
            .arg(&data)
            .query_async::<_, String>(&mut conn)
            .await;

        if result.is_err() {
            self.redis.reset().await;
        }
        result
    }
}

/// Publishes every audit-log record of a stream as a domain event.
#[derive(Debug)]
pub struct PublishJob {
    publisher: EventPublisher,
    topic_prefix: String,
}

impl PublishJob {
    pub fn new(publisher: EventPublisher, topic_prefix: impl Into<String>) -> Self {
        Self {
            publisher,
            topic_prefix: topic_prefix.into(),
        }
    }
}

#[async_trait]
impl Job for PublishJob {
    fn name(&self) -> &str {
        JOB_NAME
    }

    #[instrument(skip(self, ctx, event), fields(attempt = ctx.attempt, event_id = %event.id()), err)]
    async fn run(
        &self,
        ctx: &JobContext,
        stream: &StreamName,
        event: &ChangeEvent,
    ) -> Result<(), JobError> {
        let operation = event
            .document_field("operation_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JobError::permanent("audit-log record has no operation_type"))?;

        let event_type = event_type(stream.as_str(), operation);
        let source = event_source(&self.topic_prefix, stream.as_str());

        let entry_id = self
            .publisher
            .publish(&event_type, &source, event.resource_document())
            .await
            .map_err(|e| JobError::retryable(format!("publishing to {source} failed: {e}")))?;

        info!(
            event_type = %event_type,
            topic = %source,
            entry_id = %entry_id,
            attempts = ctx.attempt,
            "change event was published after {} attempt(s)", ctx.attempt
        );
        Ok(())
    }

    fn resource_id(&self, event: &ChangeEvent) -> Option<String> {
        event.document_field("resource_id").map(render_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changefeed_core::OperationType;
    use serde_json::json;

    #[test]
    fn type_drops_last_suffix_and_dashes_underscores() {
        assert_eq!(event_type("comments_auditlogs", "insert"), "comments.insert");
        assert_eq!(event_type("blog_posts_auditlogs", "update"), "blog-posts.update");
        assert_eq!(event_type("auditlogs", "delete"), "auditlogs.delete");
    }

    #[test]
    fn source_is_prefixed_topic_name() {
        assert_eq!(event_source("db-", "comments_auditlogs"), "db-comments-events");
        assert_eq!(event_source("db-", "blog_posts_auditlogs"), "db-blog-posts-events");
    }

    #[tokio::test]
    async fn missing_operation_type_is_permanent() {
        let job = PublishJob::new(EventPublisher::new("redis://127.0.0.1:1").unwrap(), "db-");
        let event = ChangeEvent::new(
            "1-0",
            OperationType::Insert,
            json!({"resource_id": "r1"}),
            "posts_auditlogs",
            json!({}),
        );

        let result = job
            .run(&JobContext::new(1, Some(3)), &StreamName::new("posts_auditlogs").unwrap(), &event)
            .await;

        assert!(matches!(result, Err(JobError::Permanent(_))));
        assert_eq!(job.resource_id(&event).as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn unreachable_redis_is_retryable() {
        let job = PublishJob::new(EventPublisher::new("redis://127.0.0.1:1").unwrap(), "db-");
        let event = ChangeEvent::new(
            "1-0",
            OperationType::Insert,
            json!({"operation_type": "insert"}),
            "posts_auditlogs",
            json!({}),
        );

        let result = job
            .run(&JobContext::new(1, Some(3)), &StreamName::new("posts_auditlogs").unwrap(), &event)
            .await;

        assert!(matches!(result, Err(JobError::Retryable(_))));
    }
}
