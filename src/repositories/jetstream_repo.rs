//! NATS JetStream persistence for round markers, messages, and winners.
//!
//! The repository degrades gracefully: when the broker is unreachable it
//! becomes a no-op on publish and returns empty on fetch, and the server
//! keeps serving clients without persistence.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    stream::{Config as StreamConfig, StorageType},
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{RoundMarker, RoundStatus, StoredMessage, WinnerRecord};

pub const STREAM_ROUNDS: &str = "ROUNDS";
pub const STREAM_MESSAGES: &str = "MESSAGES";
pub const STREAM_WINNERS: &str = "WINNERS";

const STREAM_LAYOUT: [(&str, &[&str]); 3] = [
    (STREAM_ROUNDS, &["rounds.started.*", "rounds.ended.*"]),
    (STREAM_MESSAGES, &["messages.*"]),
    (STREAM_WINNERS, &["winners.*"]),
];

/// Records older than this are dropped by the broker.
const STREAM_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Upper bound on messages returned to the history API.
pub const MAX_HISTORY_MESSAGES: usize = 100;
/// Upper bound on candidates considered during winner selection.
pub const MAX_WINNER_CANDIDATES: usize = 200;
/// Bounded wait for message fetches; expiry is treated as "no more messages".
pub const MESSAGE_FETCH_WAIT: Duration = Duration::from_secs(2);
/// Bounded wait for the single winner record.
const WINNER_FETCH_WAIT: Duration = Duration::from_secs(1);

/// JetStream-backed repository for the round timeline.
#[derive(Clone)]
pub struct JetStreamRepository {
    client: Option<async_nats::Client>,
    context: Option<jetstream::Context>,
}

impl JetStreamRepository {
    /// Connect to the broker. Connection failure is not fatal: the server
    /// runs without persistence and `/health` reports `disconnected`.
    pub async fn connect(nats_url: &str) -> Self {
        info!(url = %nats_url, "connecting to NATS");
        match async_nats::connect(nats_url).await {
            Ok(client) => {
                info!("connected to NATS");
                let context = jetstream::new(client.clone());
                Self {
                    client: Some(client),
                    context: Some(context),
                }
            }
            Err(e) => {
                warn!(error = %e, "NATS unreachable, message persistence disabled");
                Self::disabled()
            }
        }
    }

    /// Repository with no backend: publishes are no-ops, fetches are empty.
    pub fn disabled() -> Self {
        Self {
            client: None,
            context: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.context.is_some()
    }

    /// Connection state string reported by `/health`.
    pub fn connection_state(&self) -> &'static str {
        match &self.client {
            Some(client)
                if matches!(
                    client.connection_state(),
                    async_nats::connection::State::Connected
                ) =>
            {
                "connected"
            }
            _ => "disconnected",
        }
    }

    /// Create the three streams, or bring their configuration up to date.
    pub async fn ensure_streams(&self) {
        let Some(context) = &self.context else {
            return;
        };
        for (name, subjects) in STREAM_LAYOUT {
            let config = StreamConfig {
                name: name.to_string(),
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                storage: StorageType::File,
                max_age: STREAM_MAX_AGE,
                ..Default::default()
            };
            match context.get_stream(name).await {
                Ok(_) => match context.update_stream(config.clone()).await {
                    Ok(_) => info!(stream = name, "updated stream"),
                    Err(e) => error!(stream = name, error = %e, "failed to update stream"),
                },
                Err(_) => match context.create_stream(config).await {
                    Ok(_) => info!(stream = name, "created stream"),
                    Err(e) => error!(stream = name, error = %e, "failed to create stream"),
                },
            }
        }
    }

    /// Publish an accepted submission to `messages.{round_id}`.
    pub async fn publish_message(&self, message: &StoredMessage) -> AppResult<()> {
        self.publish(format!("messages.{}", message.round_id), message)
            .await
    }

    /// Publish a round marker to `rounds.started.{id}` or `rounds.ended.{id}`.
    pub async fn publish_round_marker(&self, marker: &RoundMarker) -> AppResult<()> {
        let subject = match marker.status {
            RoundStatus::Started => format!("rounds.started.{}", marker.round_id),
            RoundStatus::Ended => format!("rounds.ended.{}", marker.round_id),
        };
        self.publish(subject, marker).await
    }

    /// Publish the selected winner to `winners.{round_id}`.
    pub async fn publish_winner(&self, record: &WinnerRecord) -> AppResult<()> {
        self.publish(format!("winners.{}", record.round_id), record)
            .await
    }

    async fn publish<T: Serialize>(&self, subject: String, payload: &T) -> AppResult<()> {
        let Some(context) = &self.context else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(payload)?;
        let ack = context
            .publish(subject, bytes.into())
            .await
            .map_err(|e| AppError::Stream(e.to_string()))?;
        ack.await.map_err(|e| AppError::Stream(e.to_string()))?;
        Ok(())
    }

    /// Fetch up to `max` messages published for a round.
    pub async fn fetch_round_messages(
        &self,
        round_id: i64,
        max: usize,
        wait: Duration,
    ) -> AppResult<Vec<StoredMessage>> {
        self.fetch_filtered(
            STREAM_MESSAGES,
            format!("messages.{}", round_id),
            max,
            wait,
        )
        .await
    }

    /// Fetch the winner record for a round, if one was published.
    pub async fn fetch_winner(&self, round_id: i64) -> AppResult<Option<WinnerRecord>> {
        let records: Vec<WinnerRecord> = self
            .fetch_filtered(
                STREAM_WINNERS,
                format!("winners.{}", round_id),
                1,
                WINNER_FETCH_WAIT,
            )
            .await?;
        Ok(records.into_iter().next())
    }

    /// Read a filtered subject through a short-lived pull consumer. The
    /// consumer is deleted on every exit path.
    async fn fetch_filtered<T: DeserializeOwned>(
        &self,
        stream_name: &str,
        subject: String,
        max: usize,
        wait: Duration,
    ) -> AppResult<Vec<T>> {
        let Some(context) = &self.context else {
            return Ok(Vec::new());
        };
        let stream = context
            .get_stream(stream_name)
            .await
            .map_err(|e| AppError::Stream(e.to_string()))?;

        let consumer_name = format!("fetch-{}", Uuid::new_v4().as_simple());
        let consumer = stream
            .create_consumer(pull::Config {
                name: Some(consumer_name.clone()),
                deliver_policy: DeliverPolicy::All,
                ack_policy: AckPolicy::Explicit,
                filter_subject: subject,
                max_deliver: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| AppError::Stream(e.to_string()))?;

        let records = Self::drain_batch(consumer, max, wait).await;

        if let Err(e) = stream.delete_consumer(&consumer_name).await {
            debug!(consumer = %consumer_name, error = %e, "failed to delete consumer");
        }
        records
    }

    async fn drain_batch<T: DeserializeOwned>(
        consumer: PullConsumer,
        max: usize,
        wait: Duration,
    ) -> AppResult<Vec<T>> {
        let mut batch = consumer
            .batch()
            .max_messages(max)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| AppError::Stream(e.to_string()))?;

        let mut records = Vec::new();
        while let Some(message) = batch.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "error receiving stream message");
                    break;
                }
            };
            match serde_json::from_slice::<T>(&message.payload) {
                Ok(record) => records.push(record),
                Err(e) => error!(error = %e, "failed to decode stream payload"),
            }
            if let Err(e) = message.ack().await {
                warn!(error = %e, "failed to ack stream message");
            }
        }
        Ok(records)
    }

    /// Per-stream state for `/health`.
    pub async fn stream_report(&self) -> serde_json::Value {
        let Some(context) = &self.context else {
            return serde_json::json!({ "streams": {} });
        };
        let mut streams = serde_json::Map::new();
        for (name, _) in STREAM_LAYOUT {
            let entry = match context.get_stream(name).await {
                Ok(mut stream) => match stream.info().await {
                    Ok(info) => serde_json::json!({
                        "messages": info.state.messages,
                        "bytes": info.state.bytes,
                        "subjects": info.config.subjects,
                        "retention": format!("{}s", info.config.max_age.as_secs()),
                    }),
                    Err(e) => serde_json::json!({ "error": e.to_string() }),
                },
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            };
            streams.insert(name.to_string(), entry);
        }
        serde_json::json!({ "streams": streams })
    }
}
