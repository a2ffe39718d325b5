//! Change event envelope and resume position.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CoreError;

/// Kind of mutation observed on the watched collection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    /// Never dispatched: the default subscription filter drops deletes upstream.
    Delete,
}

impl OperationType {
    /// Operations a consumer subscribes to unless configured otherwise.
    pub const DISPATCHABLE: [OperationType; 3] = [
        OperationType::Insert,
        OperationType::Update,
        OperationType::Replace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
        }
    }
}

impl core::fmt::Display for OperationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(OperationType::Insert),
            "update" => Ok(OperationType::Update),
            "replace" => Ok(OperationType::Replace),
            "delete" => Ok(OperationType::Delete),
            other => Err(CoreError::UnknownOperation(other.to_string())),
        }
    }
}

/// Opaque continuation marker issued by a stream source.
///
/// The core never parses or orders positions; only the source that issued one
/// can interpret it. Handing a position to a different stream is an error the
/// source reports when the stream is reopened.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumePosition(String);

impl ResumePosition {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for ResumePosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One observed mutation, as delivered by the stream source.
///
/// Immutable once received. The core never persists events; only the resume
/// position reached after an event is checkpointed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Stream-assigned identifier, unique within the stream.
    id: String,
    operation_type: OperationType,

    /// Full current state of the affected entity; the shape belongs to the job.
    resource_document: JsonValue,

    /// Source collection identifier.
    namespace: String,
    document_key: JsonValue,
}

impl ChangeEvent {
    pub fn new(
        id: impl Into<String>,
        operation_type: OperationType,
        resource_document: JsonValue,
        namespace: impl Into<String>,
        document_key: JsonValue,
    ) -> Self {
        Self {
            id: id.into(),
            operation_type,
            resource_document,
            namespace: namespace.into(),
            document_key,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn resource_document(&self) -> &JsonValue {
        &self.resource_document
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn document_key(&self) -> &JsonValue {
        &self.document_key
    }

    /// Read a top-level field of the resource document.
    pub fn document_field(&self, name: &str) -> Option<&JsonValue> {
        self.resource_document.get(name)
    }

    /// `_id` from the document key, rendered for logs.
    pub fn document_id(&self) -> Option<String> {
        self.document_key.get("_id").map(render_id)
    }
}

/// Render an identifier value without JSON quoting for strings.
pub fn render_id(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
