use std::error::Error;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Failures raised while building or translating a request, before any
/// transport IO happens.
#[derive(Debug, Clone)]
pub enum AdapterError {
    /// The canonical request was empty where content is required.
    NilRequest,
    /// The payload kind is not servable by this adapter.
    Unsupported(&'static str),
    /// Descriptor/channel configuration does not fit this adapter.
    InvalidConfig(String),
    /// Body serialization failed.
    Serialize(String),
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::NilRequest => write!(f, "empty request"),
            AdapterError::Unsupported(what) => write!(f, "unsupported: {what}"),
            AdapterError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            AdapterError::Serialize(msg) => write!(f, "serialize: {msg}"),
        }
    }
}

impl Error for AdapterError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

/// Transport-level failure: the upstream never produced an HTTP response.
/// Non-2xx responses are *not* failures at this layer; the billing engine
/// inspects the status itself so it can refund and relay the upstream body.
#[derive(Debug, Clone)]
pub struct UpstreamFailure {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upstream transport failure ({:?}): {}", self.kind, self.message)
    }
}

impl Error for UpstreamFailure {}

/// Best-effort extraction of a human-readable message from an upstream error
/// body. Understands the OpenAI and Anthropic error envelopes and falls back
/// to the raw body.
pub fn upstream_error_message(body: &Bytes) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return message.to_string();
        }
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    String::from_utf8_lossy(body).chars().take(512).collect()
}

/// Known upstream error shapes that indicate the channel's credential or
/// account is unusable and the channel should be auto-disabled.
pub fn is_account_failure(status: u16, message: &str) -> bool {
    if status == 401 {
        return true;
    }
    let lowered = message.to_ascii_lowercase();
    lowered.contains("insufficient_quota")
        || lowered.contains("invalid api key")
        || lowered.contains("incorrect api key")
        || lowered.contains("account deactivated")
        || lowered.contains("organization has been disabled")
        || (lowered.contains("billing") && lowered.contains("deactivated"))
        || (status == 429 && lowered.contains("exceeded your current quota"))
}
