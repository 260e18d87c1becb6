//! Rules deciding which request and response bodies are copied into an
//! audit record.

use axum::http::{header, HeaderMap, StatusCode};

/// Request bodies declared (or found) larger than this are not recorded.
pub const DEFAULT_MAX_REQUEST_BODY: usize = 10 * 1024;

const SKIPPED_CONTENT_TYPES: &[&str] = &["multipart/form-data", "application/octet-stream"];
const SKIPPED_CONTENT_PREFIXES: &[&str] = &["image/", "video/", "audio/"];

/// Whether a body of this content type may be recorded at all.
///
/// Uploads and binary media never are. A missing content type is
/// treated as eligible.
pub fn is_body_eligible(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return true;
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    !SKIPPED_CONTENT_TYPES.contains(&essence.as_str())
        && !SKIPPED_CONTENT_PREFIXES.iter().any(|p| essence.starts_with(p))
}

pub fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Body-capture policy applied by the audit middleware.
#[derive(Clone, Debug)]
pub struct CapturePolicy {
    pub max_request_body: usize,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        CapturePolicy {
            max_request_body: DEFAULT_MAX_REQUEST_BODY,
        }
    }
}

impl CapturePolicy {
    /// Whether the request body should be buffered for recording.
    pub fn capture_request(&self, headers: &HeaderMap) -> bool {
        let within_limit = content_length(headers)
            .map_or(true, |len| len <= self.max_request_body as u64);
        within_limit && is_body_eligible(content_type(headers))
    }

    /// Whether a response body should be recorded. Only error responses are.
    pub fn capture_response(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        status.as_u16() >= 400 && is_body_eligible(content_type(headers))
    }

    /// Text to store for a buffered request body, if any.
    pub fn request_text(&self, body: &[u8]) -> Option<String> {
        if body.len() > self.max_request_body {
            return None;
        }
        body_text(body)
    }
}

/// Lossy UTF-8 text of a body; empty bodies are not recorded.
pub fn body_text(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(body).into_owned())
    }
}
