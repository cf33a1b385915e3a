use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::ReportableError;
use crate::model::{ChatCompletion, RequestPayload};
use crate::options::CallOptions;

/// Status reported for calls that returned a response (direct or streamed).
pub const STATUS_OK: u16 = 200;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Telemetry for one logical call: what was asked, what came back, and when.
///
/// Built once the outcome is known and handed to every collector by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub requested_at: u64,
    /// Never earlier than `requested_at`.
    pub received_at: u64,
    pub req_payload: RequestPayload,
    /// Response body: the completion on success, the API error body on a recognized error.
    pub resp_payload: Option<Value>,
    pub error_message: Option<String>,
    pub status_code: Option<u16>,
    pub options: CallOptions,
}

impl CallRecord {
    /// Record for a call that produced a response. A stream that ended without
    /// any chunk has nothing to report as `response`.
    pub fn success(
        options: CallOptions,
        requested_at: u64,
        received_at: u64,
        req_payload: RequestPayload,
        response: Option<&ChatCompletion>,
    ) -> Self {
        Self {
            requested_at,
            received_at: received_at.max(requested_at),
            req_payload,
            resp_payload: response.and_then(|r| serde_json::to_value(r).ok()),
            error_message: None,
            status_code: Some(STATUS_OK),
            options,
        }
    }

    /// Record for a failed call. `partial` is whatever a stream assembled before failing;
    /// the error's own body takes precedence when it has one.
    pub fn failure<E: ReportableError + ?Sized>(
        options: CallOptions,
        requested_at: u64,
        received_at: u64,
        req_payload: RequestPayload,
        err: &E,
        partial: Option<&ChatCompletion>,
    ) -> Self {
        let resp_payload = err
            .body()
            .or_else(|| partial.and_then(|p| serde_json::to_value(p).ok()));
        Self {
            requested_at,
            received_at: received_at.max(requested_at),
            req_payload,
            resp_payload,
            error_message: Some(err.to_string()),
            status_code: err.status_code(),
            options,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_message.is_none()
    }

    pub fn latency_ms(&self) -> u64 {
        self.received_at - self.requested_at
    }

    pub fn tags(&self) -> BTreeMap<String, String> {
        self.options.effective_tags()
    }

    pub fn fingerprint(&self) -> String {
        self.options.fingerprint_for(&self.req_payload)
    }

    /// The reported response decoded back into a completion, for successful calls.
    pub fn response(&self) -> Option<ChatCompletion> {
        if !self.is_success() {
            return None;
        }
        self.resp_payload
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
    }
}
