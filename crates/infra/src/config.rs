//! Worker configuration loaded from environment variables.
//!
//! With an environment label (e.g. `uat`), `UAT_<KEY>` takes precedence over
//! `<KEY>`, so one environment file can hold settings for several deployments.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use changefeed_core::StreamName;

pub const DEFAULT_CHECKPOINT_TABLE: &str = "stream_checkpoints";
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_STREAM_KEY_PREFIX: &str = "changefeed:";
pub const DEFAULT_DEAD_LETTER_STREAM: &str = "changefeed:dead-letters";
pub const DEFAULT_STREAM_BLOCK_MS: u64 = 5000;
pub const DEFAULT_STREAM_BATCH_SIZE: usize = 64;
pub const DEFAULT_EVENT_TOPIC_PREFIX: &str = "db-";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("unknown job {0:?} (expected one of: auditlogs, publish)")]
    UnknownJob(String),

    #[error("job {job} cannot run on stream {stream}: {reason}")]
    IncompatibleStream {
        job: String,
        stream: String,
        reason: String,
    },

    #[error("{0}")]
    Unsupported(String),
}

/// What the consumer does after an event was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoisonEventPolicy {
    /// Advance the checkpoint and keep consuming.
    #[default]
    Skip,
    /// Stop without advancing the checkpoint and end the process.
    Halt,
}

impl PoisonEventPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoisonEventPolicy::Skip => "skip",
            PoisonEventPolicy::Halt => "halt",
        }
    }
}

impl FromStr for PoisonEventPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(PoisonEventPolicy::Skip),
            "halt" => Ok(PoisonEventPolicy::Halt),
            other => Err(ConfigError::Invalid {
                key: "POISON_EVENT_POLICY".to_string(),
                reason: format!("expected `skip` or `halt`, got {other:?}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub env_label: Option<String>,
    pub database_url: String,
    pub checkpoint_table: String,
    pub redis_url: String,
    /// Prepended to the stream name to form the Redis key of the change stream.
    pub stream_key_prefix: String,
    pub dead_letter_stream: String,
    pub stream_block: Duration,
    pub stream_batch_size: usize,
    /// Only required by the `auditlogs` job.
    pub auditlog_endpoint: Option<String>,
    pub event_topic_prefix: String,
    pub poison_policy: PoisonEventPolicy,
}

impl WorkerConfig {
    pub fn from_env(env_label: Option<&str>) -> Result<Self, ConfigError> {
        Self::from_lookup(env_label, |key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests, embedded use).
    pub fn from_lookup<F>(env_label: Option<&str>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { label: env_label, lookup };

        Ok(Self {
            env_label: env_label.map(str::to_string),
            database_url: env.required("DATABASE_URL")?,
            checkpoint_table: env.or("CHECKPOINT_TABLE", DEFAULT_CHECKPOINT_TABLE),
            redis_url: env.or("REDIS_URL", DEFAULT_REDIS_URL),
            stream_key_prefix: env.or("STREAM_KEY_PREFIX", DEFAULT_STREAM_KEY_PREFIX),
            dead_letter_stream: env.or("DEAD_LETTER_STREAM", DEFAULT_DEAD_LETTER_STREAM),
            stream_block: Duration::from_millis(env.parsed("STREAM_BLOCK_MS", DEFAULT_STREAM_BLOCK_MS)?),
            stream_batch_size: env.parsed("STREAM_BATCH_SIZE", DEFAULT_STREAM_BATCH_SIZE)?,
            auditlog_endpoint: env.get("AUDITLOG_ENDPOINT"),
            event_topic_prefix: env.or("EVENT_TOPIC_PREFIX", DEFAULT_EVENT_TOPIC_PREFIX),
            poison_policy: match env.get("POISON_EVENT_POLICY") {
                Some(raw) => raw.parse()?,
                None => PoisonEventPolicy::default(),
            },
        })
    }

    /// Redis key of the change stream for `stream`.
    pub fn stream_key(&self, stream: &StreamName) -> String {
        format!("{}{}", self.stream_key_prefix, stream)
    }

    pub fn require_auditlog_endpoint(&self) -> Result<&str, ConfigError> {
        self.auditlog_endpoint
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("AUDITLOG_ENDPOINT".to_string()))
    }
}

struct Env<'a, F> {
    label: Option<&'a str>,
    lookup: F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        let labelled = self
            .label
            .and_then(|label| (self.lookup)(&format!("{}_{key}", label.to_ascii_uppercase())));
        labelled
            .or_else(|| (self.lookup)(key))
            .filter(|value| !value.trim().is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }
}
