//! HTTP handlers: round history and health.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::hub::Hub;
use crate::repositories::{JetStreamRepository, MAX_HISTORY_MESSAGES, MESSAGE_FETCH_WAIT};

/// Shared application state for the HTTP and WebSocket surface.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub stream: JetStreamRepository,
}

impl AppState {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
    pub fn stream(&self) -> &JetStreamRepository {
        &self.stream
    }
}

/// GET /api/rounds/:round_id — messages and winner for one round.
pub async fn round_history(
    State(state): State<AppState>,
    Path(round_id): Path<i64>,
) -> AppResult<Json<Value>> {
    if !state.stream().is_available() {
        return Err(AppError::StreamUnavailable);
    }

    let messages = state
        .stream()
        .fetch_round_messages(round_id, MAX_HISTORY_MESSAGES, MESSAGE_FETCH_WAIT)
        .await?;
    let winner = match state.stream().fetch_winner(round_id).await {
        Ok(winner) => winner,
        Err(e) => {
            warn!(round_id, error = %e, "winner lookup failed");
            None
        }
    };

    let count = messages.len();
    Ok(Json(json!({
        "round_id": round_id,
        "messages": messages,
        "winner": winner,
        "count": count,
        "timestamp": chrono::Utc::now(),
    })))
}

/// GET /api/rounds — reached only when the round id is missing.
pub async fn round_history_missing_id() -> AppError {
    AppError::Validation("round id is required".to_string())
}

/// GET /health — liveness probe with stream backend state.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let mut body = json!({
        "status": "ok",
        "nats": state.stream().connection_state(),
        "uptime": format!("{}s", state.hub().uptime().as_secs()),
        "connections": state.hub().connected(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    if state.stream().is_available() {
        body["jetstream"] = state.stream().stream_report().await;
    }
    Json(body)
}
