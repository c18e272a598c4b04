//! The hub: single event loop owning the client registry and broadcast
//! fan-out, plus the round state shared with the scheduler and the
//! submission pipeline.

mod client;
mod messages;
mod rounds;

pub use client::{ClientHandle, OUTBOUND_QUEUE_CAPACITY};
pub use rounds::ROUND_DURATION;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::models::{Envelope, RoundMessage};
use crate::repositories::JetStreamRepository;

/// Commands accepted by the hub event loop. The queue is unbounded so pump
/// and scheduler sends never block.
#[derive(Debug)]
enum HubCommand {
    Register(ClientHandle),
    Unregister(u64),
    Broadcast(String),
}

/// Round bookkeeping, guarded by the hub's single exclusion domain.
#[derive(Debug, Default)]
pub(crate) struct RoundState {
    pub active: bool,
    pub current_round_id: i64,
    /// Usernames that already submitted this round.
    pub limiter: HashSet<String>,
    /// Accepted submissions per round id, kept for winner selection.
    pub round_messages: HashMap<i64, Vec<RoundMessage>>,
}

pub struct Hub {
    commands: mpsc::UnboundedSender<HubCommand>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<HubCommand>>>,
    pub(crate) state: Mutex<RoundState>,
    stream: JetStreamRepository,
    next_conn_id: AtomicU64,
    connected: AtomicUsize,
    started_at: Instant,
}

impl Hub {
    pub fn new(stream: JetStreamRepository) -> Arc<Self> {
        let (commands, inbox) = mpsc::unbounded_channel();
        Arc::new(Self {
            commands,
            inbox: Mutex::new(Some(inbox)),
            state: Mutex::new(RoundState::default()),
            stream,
            next_conn_id: AtomicU64::new(1),
            connected: AtomicUsize::new(0),
            started_at: Instant::now(),
        })
    }

    /// Event loop: starts the round scheduler, then serializes registry
    /// mutations and broadcast fan-out. The registry lives on this task's
    /// stack, so nothing else can touch it.
    pub async fn run(self: Arc<Self>) {
        let inbox = self.inbox.lock().await.take();
        let Some(mut inbox) = inbox else {
            warn!("hub event loop already running");
            return;
        };

        tokio::spawn(self.clone().run_round_scheduler());

        let mut clients: HashMap<u64, ClientHandle> = HashMap::new();
        while let Some(command) = inbox.recv().await {
            match command {
                HubCommand::Register(client) => {
                    // Late joiners still learn the current round id.
                    let (active, round_id) = {
                        let state = self.state.lock().await;
                        (state.active, state.current_round_id)
                    };
                    if active {
                        self.send_to_client(&client, &Envelope::round_start(round_id));
                    }
                    info!(
                        username = %client.username,
                        conn_id = client.conn_id,
                        total = clients.len() + 1,
                        "client registered"
                    );
                    clients.insert(client.conn_id, client);
                    self.connected.store(clients.len(), Ordering::Relaxed);
                }
                HubCommand::Unregister(conn_id) => {
                    if let Some(client) = clients.remove(&conn_id) {
                        // Best-effort goodbye; dropping the handle closes the
                        // queue once the read pump releases its reply sender.
                        let _ = client.sender.try_send(Message::Close(None));
                        self.connected.store(clients.len(), Ordering::Relaxed);
                        info!(
                            username = %client.username,
                            conn_id,
                            total = clients.len(),
                            "client unregistered"
                        );
                    }
                }
                HubCommand::Broadcast(frame) => {
                    for client in clients.values() {
                        if let Err(mpsc::error::TrySendError::Full(_)) =
                            client.sender.try_send(Message::Text(frame.clone()))
                        {
                            warn!(
                                username = %client.username,
                                conn_id = client.conn_id,
                                "outbound queue full, unregistering"
                            );
                            self.request_unregister(client.conn_id);
                        }
                    }
                }
            }
        }
    }

    /// Hand a freshly upgraded client to the event loop.
    pub fn register(&self, client: ClientHandle) {
        let _ = self.commands.send(HubCommand::Register(client));
    }

    /// Ask the event loop to drop a client. Safe to call more than once.
    pub fn request_unregister(&self, conn_id: u64) {
        let _ = self.commands.send(HubCommand::Unregister(conn_id));
    }

    /// Queue an envelope for delivery to every connected client.
    pub(crate) fn broadcast_envelope(&self, envelope: &Envelope) {
        match serde_json::to_string(envelope) {
            Ok(frame) => {
                let _ = self.commands.send(HubCommand::Broadcast(frame));
            }
            Err(e) => error!(error = %e, "failed to encode broadcast envelope"),
        }
    }

    /// Non-blocking enqueue to one client; a full queue requests
    /// unregistration instead of waiting (drop-on-slow).
    pub(crate) fn send_to_client(&self, client: &ClientHandle, envelope: &Envelope) {
        let frame = match serde_json::to_string(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "failed to encode envelope");
                return;
            }
        };
        if let Err(mpsc::error::TrySendError::Full(_)) =
            client.sender.try_send(Message::Text(frame))
        {
            warn!(
                username = %client.username,
                conn_id = client.conn_id,
                "outbound queue full, unregistering"
            );
            self.request_unregister(client.conn_id);
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Live connection count, for `/health`.
    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    /// Time since the hub was created, for `/health`.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn stream(&self) -> &JetStreamRepository {
        &self.stream
    }
}
