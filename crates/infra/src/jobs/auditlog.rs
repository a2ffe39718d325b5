//! Audit-log job: records every change of a source collection through the
//! audit-log HTTP endpoint.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{info, instrument};

use changefeed_core::{ChangeEvent, StreamName, render_id};
use changefeed_events::{Job, JobContext, JobError};

pub const JOB_NAME: &str = "auditlogs";

/// Statuses for which a later attempt may succeed.
pub const RETRYABLE_STATUS_CODES: [u16; 5] = [408, 429, 502, 503, 504];

/// POSTs `{collection, document}` to the audit-log endpoint.
#[derive(Debug, Clone)]
pub struct AuditLogJob {
    client: Client,
    endpoint: String,
}

impl AuditLogJob {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Classify a non-success response.
pub fn classify_status(status: StatusCode, body: &str) -> JobError {
    let msg = if body.is_empty() {
        format!("audit-log endpoint answered {status}")
    } else {
        format!("audit-log endpoint answered {status}: {body}")
    };
    if RETRYABLE_STATUS_CODES.contains(&status.as_u16()) {
        JobError::retryable(msg)
    } else {
        JobError::permanent(msg)
    }
}

#[async_trait]
impl Job for AuditLogJob {
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
        let payload = json!({
            "collection": stream.as_str(),
            "document": event.resource_document(),
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| JobError::retryable(format!("request to {} failed: {e}", self.endpoint)))?;

        let status = response.status();
        if status.is_success() {
            info!(
                attempts = ctx.attempt,
                "auditlog was created after {} attempt(s)", ctx.attempt
            );
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    fn resource_id(&self, event: &ChangeEvent) -> Option<String> {
        event.document_field("_id").map(render_id)
    }
}
