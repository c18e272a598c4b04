//! Round-based message competition server.
//!
//! Clients connect over WebSocket under a username and may submit one
//! message per fixed-length round; the server announces one uniformly
//! random winner per round and persists the round timeline to NATS
//! JetStream so the history API can replay it.

pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod models;
pub mod repositories;

pub use config::Config;
pub use error::AppError;
pub use handlers::http::AppState;
pub use hub::Hub;
pub use repositories::JetStreamRepository;

use axum::routing::get;
use handlers::http;

/// Build the API router (ws, round history, health). Used by main and by
/// integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/api/rounds", get(http::round_history_missing_id))
        .route("/api/rounds/:round_id", get(http::round_history))
        .route("/health", get(http::health))
        .with_state(state)
}
