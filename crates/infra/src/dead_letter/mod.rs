//! Dead-letter sinks.

#[cfg(feature = "redis")]
pub mod redis_streams;

use tracing::{error, info};

pub use changefeed_events::{
    DeadLetter, DeadLetterError, DeadLetterReason, DeadLetterSink, InMemoryDeadLetterSink,
};
#[cfg(feature = "redis")]
pub use redis_streams::RedisDeadLetterSink;

use crate::retry::{RetryPolicy, retry_with_backoff};

/// Publish `letter`, retrying transport failures under `policy`.
///
/// With the default unbounded checkpoint I/O policy this only returns once the
/// sink accepted the letter.
pub async fn publish_with_retry(
    sink: &dyn DeadLetterSink,
    letter: &DeadLetter,
    policy: &RetryPolicy,
) -> Result<(), DeadLetterError> {
    let result = retry_with_backoff(policy, "dead_letter.publish", || sink.publish(letter)).await;
    match &result {
        Ok(()) => info!(
            dead_letter_id = %letter.id,
            event_id = %letter.event.id(),
            reason = letter.reason.as_str(),
            attempts = letter.attempts,
            "event dead-lettered"
        ),
        Err(err) => error!(
            dead_letter_id = %letter.id,
            event_id = %letter.event.id(),
            error = %err,
            "dead letter could not be published"
        ),
    }
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use changefeed_core::{ChangeEvent, JobName, OperationType, StreamName};
    use serde_json::json;

    fn letter() -> DeadLetter {
        DeadLetter::new(
            StreamName::new("posts").unwrap(),
            JobName::new("publish").unwrap(),
            ChangeEvent::new("3-0", OperationType::Insert, json!({}), "posts", json!({"_id": 3})),
            DeadLetterReason::PermanentFailure,
            "missing operation_type",
            1,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_sink_accepts() {
        let sink = InMemoryDeadLetterSink::new();
        sink.fail_next(4);

        publish_with_retry(&sink, &letter(), &RetryPolicy::checkpoint_io())
            .await
            .unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.publish_calls(), 5);
    }

    #[tokio::test]
    async fn bounded_policy_reports_failure() {
        let sink = InMemoryDeadLetterSink::new();
        sink.fail_next(10);
        let policy = RetryPolicy::new(Duration::ZERO, Duration::ZERO, Some(2));

        let result = publish_with_retry(&sink, &letter(), &policy).await;

        assert!(matches!(result, Err(DeadLetterError::Transport(_))));
        assert!(sink.is_empty());
    }
}
