use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

/// Key under [`LogRecord::custom_fields`] flagging 4xx/5xx responses.
pub const IS_ERROR_FIELD: &str = "isError";

/// Audit record for a single HTTP call.
///
/// Created by the middleware when the call starts, filled in while the
/// call runs and finalized exactly once when it completes. After
/// [`LogRecord::finalize`] the record is handed to the dispatcher and is
/// not touched again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_string: Option<String>,
    pub status_code: u16,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
}

impl LogRecord {
    /// Start a record for the call identified by `request_id`.
    pub fn new(request_id: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        LogRecord {
            request_id: request_id.into(),
            timestamp: Utc::now(),
            method: method.into(),
            path: path.into(),
            query_string: None,
            status_code: 0,
            duration_ms: 0,
            user_id: None,
            user_email: None,
            ip_address: None,
            user_agent: None,
            request_headers: BTreeMap::new(),
            request_body: None,
            response_body: None,
            error_message: None,
            stack_trace: None,
            custom_fields: BTreeMap::new(),
        }
    }

    /// Stamp completion time and elapsed duration, and flag error
    /// responses in `custom_fields`.
    pub fn finalize(&mut self, started: Instant) {
        self.timestamp = Utc::now();
        self.duration_ms = started.elapsed().as_millis() as u64;
        if self.status_code >= 400 {
            self.custom_fields
                .insert(IS_ERROR_FIELD.to_string(), serde_json::Value::Bool(true));
        }
    }

    /// Whether the record describes a 4xx/5xx response.
    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}
