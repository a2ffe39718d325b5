//! Strongly-typed names identifying a watched stream and the job consuming it.
//!
//! A checkpoint is keyed by the `(StreamName, JobName)` pair, so both are
//! validated once at the edge and then passed around by value.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Name of a watched stream (the source collection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamName(String);

/// Name of the job run for every event of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobName(String);

const MAX_NAME_LEN: usize = 120;

fn validate(kind: &str, raw: &str) -> Result<(), CoreError> {
    if raw.is_empty() {
        return Err(CoreError::invalid_name(format!("{kind} must not be empty")));
    }
    if raw.len() > MAX_NAME_LEN {
        return Err(CoreError::invalid_name(format!(
            "{kind} longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if let Some(c) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(CoreError::invalid_name(format!(
            "{kind} contains unsupported character {c:?}"
        )));
    }
    Ok(())
}

macro_rules! impl_name_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Validate and wrap a name.
            ///
            /// Names are limited to ASCII alphanumerics, `_`, `-` and `.` so they
            /// can be embedded in storage keys without escaping.
            pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
                let raw = raw.into();
                validate($name, &raw)?;
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = CoreError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_name_newtype!(StreamName, "stream name");
impl_name_newtype!(JobName, "job name");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_collection_style_names() {
        let stream = StreamName::new("blog_posts_auditlogs").unwrap();
        assert_eq!(stream.as_str(), "blog_posts_auditlogs");
        assert_eq!(stream.to_string(), "blog_posts_auditlogs");

        let job: JobName = "auditlogs".parse().unwrap();
        assert_eq!(job.as_str(), "auditlogs");
    }

    #[test]
    fn rejects_empty_and_unsafe_names() {
        assert!(matches!(StreamName::new(""), Err(CoreError::InvalidName(_))));
        assert!(matches!(StreamName::new("posts:1"), Err(CoreError::InvalidName(_))));
        assert!(matches!(JobName::new("a b"), Err(CoreError::InvalidName(_))));
        assert!(JobName::new("x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn serde_round_trip_validates() {
        let json = serde_json::to_string(&StreamName::new("posts").unwrap()).unwrap();
        assert_eq!(json, "\"posts\"");

        let bad: Result<StreamName, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }
}
