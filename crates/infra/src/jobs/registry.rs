//! The closed set of job variants, resolved once at startup.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use changefeed_core::{JobName, StreamName};
use changefeed_events::Job;

use super::auditlog::AuditLogJob;
use crate::config::{ConfigError, WorkerConfig};

/// Marker of audit-log collections in stream names.
const AUDITLOG_MARKER: &str = "auditlogs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Document every change of a source collection via the audit-log endpoint.
    AuditLogs,
    /// Publish audit-log records as domain events.
    Publish,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::AuditLogs, JobKind::Publish];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::AuditLogs => super::auditlog::JOB_NAME,
            JobKind::Publish => "publish",
        }
    }

    /// Reject job/stream pairs that make no sense.
    ///
    /// `auditlogs` consumes source collections, so it may not run on an
    /// audit-log stream (it would audit its own output). `publish` consumes
    /// audit-log streams only.
    pub fn validate_stream(&self, stream: &StreamName) -> Result<(), ConfigError> {
        let is_auditlog_stream = stream.as_str().contains(AUDITLOG_MARKER);
        let reason = match self {
            JobKind::AuditLogs if is_auditlog_stream => "auditlogs cannot run on an audit-log stream",
            JobKind::Publish if !is_auditlog_stream => "publish only runs on audit-log streams",
            _ => return Ok(()),
        };
        Err(ConfigError::IncompatibleStream {
            job: self.as_str().to_string(),
            stream: stream.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Construct the job for this variant.
    pub fn build(&self, config: &WorkerConfig) -> Result<Arc<dyn Job>, ConfigError> {
        match self {
            JobKind::AuditLogs => {
                let endpoint = config.require_auditlog_endpoint()?;
                Ok(Arc::new(AuditLogJob::new(reqwest::Client::new(), endpoint)))
            }
            JobKind::Publish => build_publish(config),
        }
    }
}

#[cfg(feature = "redis")]
fn build_publish(config: &WorkerConfig) -> Result<Arc<dyn Job>, ConfigError> {
    use super::publish::{EventPublisher, PublishJob};

    let publisher = EventPublisher::new(&config.redis_url).map_err(|e| ConfigError::Invalid {
        key: "REDIS_URL".to_string(),
        reason: e.to_string(),
    })?;
    Ok(Arc::new(PublishJob::new(publisher, config.event_topic_prefix.clone())))
}

#[cfg(not(feature = "redis"))]
fn build_publish(_config: &WorkerConfig) -> Result<Arc<dyn Job>, ConfigError> {
    Err(ConfigError::Unsupported(
        "the publish job requires the `redis` feature".to_string(),
    ))
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auditlogs" => Ok(JobKind::AuditLogs),
            // `events` is the historical name of the publish job.
            "publish" | "events" => Ok(JobKind::Publish),
            other => Err(ConfigError::UnknownJob(other.to_string())),
        }
    }
}

impl TryFrom<&JobName> for JobKind {
    type Error = ConfigError;

    fn try_from(name: &JobName) -> Result<Self, Self::Error> {
        name.as_str().parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(name: &str) -> StreamName {
        StreamName::new(name).unwrap()
    }

    fn config(endpoint: Option<&str>) -> WorkerConfig {
        let endpoint = endpoint.map(str::to_string);
        WorkerConfig::from_lookup(None, move |key| match key {
            "DATABASE_URL" => Some("postgres://localhost/cf".to_string()),
            "AUDITLOG_ENDPOINT" => endpoint.clone(),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn parses_known_names() {
        assert_eq!("auditlogs".parse::<JobKind>().unwrap(), JobKind::AuditLogs);
        assert_eq!("publish".parse::<JobKind>().unwrap(), JobKind::Publish);
        assert_eq!("events".parse::<JobKind>().unwrap(), JobKind::Publish);
        assert_eq!(
            "backup".parse::<JobKind>(),
            Err(ConfigError::UnknownJob("backup".to_string()))
        );
        for kind in JobKind::ALL {
            assert_eq!(kind.to_string().parse::<JobKind>().unwrap(), kind);
        }
    }

    #[test]
    fn auditlogs_only_runs_on_source_collections() {
        assert!(JobKind::AuditLogs.validate_stream(&stream("blog_posts")).is_ok());
        assert!(matches!(
            JobKind::AuditLogs.validate_stream(&stream("blog_posts_auditlogs")),
            Err(ConfigError::IncompatibleStream { .. })
        ));
    }

    #[test]
    fn publish_only_runs_on_auditlog_collections() {
        assert!(JobKind::Publish.validate_stream(&stream("blog_posts_auditlogs")).is_ok());
        assert!(JobKind::Publish.validate_stream(&stream("blog_posts")).is_err());
    }

    #[test]
    fn auditlogs_requires_endpoint() {
        assert_eq!(
            JobKind::AuditLogs.build(&config(None)).err(),
            Some(ConfigError::Missing("AUDITLOG_ENDPOINT".to_string()))
        );
        let job = JobKind::AuditLogs
            .build(&config(Some("http://audit.local/auditlogs")))
            .unwrap();
        assert_eq!(job.name(), "auditlogs");
    }
}
