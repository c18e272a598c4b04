//! Inbound submission handling: validation, per-round admission,
//! persistence, and acknowledgement.

use tracing::{error, info};

use crate::models::{
    round::unix_now, Envelope, ErrorCode, RoundMessage, StoredMessage, KIND_CLIENT_MESSAGE,
    PROTOCOL_VERSION,
};

use super::{ClientHandle, Hub};

const MIN_CONTENT_LEN: usize = 1;
const MAX_CONTENT_LEN: usize = 500;

/// A submission is valid when its trimmed length is 1..=500 bytes.
pub(crate) fn validate_message_content(content: &str) -> bool {
    let trimmed = content.trim();
    (MIN_CONTENT_LEN..=MAX_CONTENT_LEN).contains(&trimmed.len())
}

impl Hub {
    /// Admission pipeline for one decoded envelope. The round check and the
    /// submission-limiter mark happen under one lock acquisition, so a
    /// submission cannot race a round ending.
    pub async fn handle_client_message(&self, client: &ClientHandle, envelope: Envelope) {
        if envelope.version != PROTOCOL_VERSION {
            self.send_to_client(
                client,
                &Envelope::error(
                    ErrorCode::InvalidVersion,
                    "Unsupported protocol version.",
                    &client.username,
                ),
            );
            return;
        }
        if envelope.kind != KIND_CLIENT_MESSAGE {
            self.send_to_client(
                client,
                &Envelope::error(
                    ErrorCode::InvalidType,
                    "Invalid message type.",
                    &client.username,
                ),
            );
            return;
        }

        let round_id = {
            let mut state = self.state.lock().await;
            if !state.active {
                drop(state);
                self.send_to_client(
                    client,
                    &Envelope::error(
                        ErrorCode::OutsideRound,
                        "Message sent outside an active round.",
                        &client.username,
                    ),
                );
                return;
            }
            if !state.limiter.insert(client.username.clone()) {
                drop(state);
                self.send_to_client(
                    client,
                    &Envelope::error(
                        ErrorCode::AlreadySent,
                        "You have already sent a message this round.",
                        &client.username,
                    ),
                );
                return;
            }
            state.current_round_id
        };

        if envelope.data.trim().is_empty() {
            self.send_to_client(
                client,
                &Envelope::error(
                    ErrorCode::InvalidData,
                    "Missing message data.",
                    &client.username,
                ),
            );
            return;
        }
        if !validate_message_content(&envelope.data) {
            self.send_to_client(
                client,
                &Envelope::error(
                    ErrorCode::InvalidContent,
                    "Invalid message content: must be 1-500 characters.",
                    &client.username,
                ),
            );
            return;
        }

        let submitted_at = unix_now();
        {
            let mut state = self.state.lock().await;
            state
                .round_messages
                .entry(round_id)
                .or_default()
                .push(RoundMessage {
                    username: client.username.clone(),
                    content: envelope.data.clone(),
                    submitted_at,
                });
        }

        let record = StoredMessage {
            username: client.username.clone(),
            content: envelope.data,
            timestamp: submitted_at,
            round_id,
        };
        if let Err(e) = self.stream().publish_message(&record).await {
            error!(username = %client.username, round_id, error = %e, "failed to publish message");
        }

        self.send_to_client(client, &Envelope::ack(&client.username));
        info!(username = %client.username, round_id, "message accepted");
    }
}
