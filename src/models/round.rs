//! Round records: the in-memory submission buffer entry and the JSON
//! payloads published to the event stream.

use serde::{Deserialize, Serialize};

/// One accepted submission, kept in memory for winner selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundMessage {
    pub username: String,
    pub content: String,
    pub submitted_at: i64,
}

/// Payload published to `messages.{round_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub username: String,
    pub content: String,
    pub timestamp: i64,
    pub round_id: i64,
}

/// Payload published to `rounds.started.{round_id}` / `rounds.ended.{round_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundMarker {
    pub round_id: i64,
    pub timestamp: i64,
    pub status: RoundStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Started,
    Ended,
}

/// Payload published to `winners.{round_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerRecord {
    pub round_id: i64,
    pub username: String,
    pub content: String,
    pub timestamp: i64,
}

/// Unix seconds, the timestamp unit of every stream payload.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
