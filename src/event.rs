//! Candidate telemetry events as seen by the governance layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sampling::Severity;

/// Key/value attributes attached to an event, ordered by key.
pub type Attributes = serde_json::Map<String, Value>;

/// A candidate log or trace event handed in by a call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl Event {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            attributes: Attributes::new(),
            trace_id: None,
            user_id: None,
            request_id: None,
        }
    }

    /// Attach one attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// An event that passed sampling and was sanitized, ready for an exporter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GovernedEvent {
    pub severity: Severity,
    pub message: String,
    pub attributes: Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// String form of an attribute value as used for matching and scanning.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
