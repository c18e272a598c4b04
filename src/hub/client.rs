//! Connected-client handle shared between the upgrade path, the pumps, and
//! the hub registry.

use axum::extract::ws::Message;
use tokio::sync::mpsc;

/// Outbound queue depth per client; a full queue unregisters the client.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// One connected user, for the lifetime of one connection. The username is
/// the submission-limiter key; the sender feeds the write pump.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub conn_id: u64,
    pub username: String,
    pub sender: mpsc::Sender<Message>,
}
