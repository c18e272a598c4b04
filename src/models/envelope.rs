//! Wire envelope exchanged over the WebSocket, one JSON object per frame.

use serde::{Deserialize, Serialize};

/// Protocol version embedded in every envelope; mismatches are rejected.
pub const PROTOCOL_VERSION: &str = "1.0";

/// The only client-to-server envelope kind.
pub const KIND_CLIENT_MESSAGE: &str = "client_message";

/// Envelope shared by both directions. Server-to-client kinds:
/// `round_start`, `round_end`, `countdown`, `ack`, `error`, `selected_text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl Envelope {
    fn server(kind: &str, data: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            kind: kind.to_string(),
            username: None,
            data: data.into(),
            error_code: None,
        }
    }

    /// Announces a newly started round; `data` carries the round id.
    pub fn round_start(round_id: i64) -> Self {
        Self::server("round_start", round_id.to_string())
    }

    /// Announces the end of a round; `data` carries the ended round id.
    pub fn round_end(round_id: i64) -> Self {
        Self::server("round_end", round_id.to_string())
    }

    /// Per-second countdown tick; `data` carries the remaining seconds.
    pub fn countdown(remaining: u64) -> Self {
        Self::server("countdown", remaining.to_string())
    }

    /// Acknowledges an accepted submission.
    pub fn ack(username: &str) -> Self {
        let mut envelope = Self::server("ack", "Message received successfully");
        envelope.username = Some(username.to_string());
        envelope
    }

    /// Winner announcement or the no-messages fallback.
    pub fn selected_text(data: impl Into<String>) -> Self {
        Self::server("selected_text", data)
    }

    /// Rejection with a stable error code and a human-readable reason.
    pub fn error(code: ErrorCode, data: impl Into<String>, username: &str) -> Self {
        let mut envelope = Self::server("error", data);
        envelope.username = Some(username.to_string());
        envelope.error_code = Some(code.as_str().to_string());
        envelope
    }
}

/// Stable error codes reported to clients alongside a human-readable reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidJson,
    InvalidVersion,
    InvalidType,
    OutsideRound,
    InvalidData,
    InvalidContent,
    AlreadySent,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "INVALID_JSON",
            ErrorCode::InvalidVersion => "INVALID_VERSION",
            ErrorCode::InvalidType => "INVALID_TYPE",
            ErrorCode::OutsideRound => "OUTSIDE_ROUND",
            ErrorCode::InvalidData => "INVALID_DATA",
            ErrorCode::InvalidContent => "INVALID_CONTENT",
            ErrorCode::AlreadySent => "ALREADY_SENT",
        }
    }
}
