//! WebSocket handler: username validation, upgrade, and the per-client
//! read/write pumps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::error::AppError;
use crate::handlers::http::AppState;
use crate::hub::{ClientHandle, Hub, OUTBOUND_QUEUE_CAPACITY};
use crate::models::{Envelope, ErrorCode};

/// Inbound frames larger than this are rejected by the socket.
const MAX_FRAME_SIZE: usize = 512;
/// A connection with no inbound frame (pongs included) for this long is dropped.
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// A frame write that takes longer than this marks the connection dead.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Ping cadence; must stay below the read deadline.
const PING_PERIOD: Duration = Duration::from_secs(READ_DEADLINE.as_secs() * 9 / 10);

/// Upgrade `GET /ws?username=...`. The username is validated before the
/// upgrade; violations answer 400 with a reason.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let username = params
        .get("username")
        .cloned()
        .ok_or_else(|| AppError::Validation("username is required".to_string()))?;
    if !validate_username(&username) {
        return Err(AppError::Validation(
            "invalid username: must be 3-20 characters, alphanumeric and underscore only"
                .to_string(),
        ));
    }

    let hub = state.hub().clone();
    Ok(ws
        .max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_socket(hub, socket, username)))
}

/// Usernames are 3-20 characters from `[A-Za-z0-9_]`.
pub(crate) fn validate_username(username: &str) -> bool {
    (3..=20).contains(&username.len())
        && username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

async fn handle_socket(hub: Arc<Hub>, socket: WebSocket, username: String) {
    let conn_id = hub.next_conn_id();
    let (sink, stream) = socket.split();
    let (sender, outbound) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);

    let client = ClientHandle {
        conn_id,
        username,
        sender,
    };
    hub.register(client.clone());

    let write_task = tokio::spawn(write_pump(sink, outbound));
    read_pump(&hub, &client, stream).await;

    hub.request_unregister(conn_id);
    // Releasing the reply sender lets the write pump observe queue closure.
    drop(client);
    if let Err(e) = write_task.await {
        debug!(conn_id, error = %e, "write pump join error");
    }
}

/// Reads envelopes until the transport fails, the peer closes, or the read
/// deadline passes without any inbound frame.
async fn read_pump(hub: &Arc<Hub>, client: &ClientHandle, mut stream: SplitStream<WebSocket>) {
    let mut last_active = Instant::now();
    loop {
        let frame = match timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                warn!(username = %client.username, "read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                error!(username = %client.username, error = %e, "websocket read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        last_active = Instant::now();

        match frame {
            Message::Text(text) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => hub.handle_client_message(client, envelope).await,
                Err(_) => {
                    let reply = Envelope::error(
                        ErrorCode::InvalidJson,
                        "Invalid JSON format.",
                        &client.username,
                    );
                    hub.send_to_client(client, &reply);
                }
            },
            Message::Close(_) => break,
            // Pongs only refresh the deadline; axum answers pings itself.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }
    debug!(
        username = %client.username,
        idle_secs = last_active.elapsed().as_secs(),
        "read pump exited"
    );
}

/// Drains the outbound queue onto the socket, folding queued frames into a
/// single write, and keeps the connection alive with periodic pings.
async fn write_pump(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Message>) {
    let mut pinger = tokio::time::interval(PING_PERIOD);
    pinger.tick().await; // the first tick is immediate; skip it

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Message::Text(mut payload)) => {
                    let mut pending_close = false;
                    while let Ok(next) = outbound.try_recv() {
                        match next {
                            Message::Text(text) => {
                                payload.push('\n');
                                payload.push_str(&text);
                            }
                            Message::Close(_) => {
                                pending_close = true;
                                break;
                            }
                            _ => {}
                        }
                    }
                    if write_frame(&mut sink, Message::Text(payload)).await.is_err() {
                        break;
                    }
                    if pending_close {
                        let _ = write_frame(&mut sink, Message::Close(None)).await;
                        break;
                    }
                }
                Some(close @ Message::Close(_)) => {
                    let _ = write_frame(&mut sink, close).await;
                    break;
                }
                Some(other) => {
                    if write_frame(&mut sink, other).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Queue closed by the hub; say goodbye and stop.
                    let _ = write_frame(&mut sink, Message::Close(None)).await;
                    break;
                }
            },
            _ = pinger.tick() => {
                if write_frame(&mut sink, Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: Message,
) -> Result<(), ()> {
    match timeout(WRITE_DEADLINE, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "websocket write error");
            Err(())
        }
        Err(_) => {
            warn!("write deadline exceeded");
            Err(())
        }
    }
}
