//! Round lifecycle: the fixed-interval scheduler, the countdown task, and
//! winner selection.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info};

use crate::models::{round::unix_now, Envelope, RoundMarker, RoundStatus, WinnerRecord};
use crate::repositories::{MAX_WINNER_CANDIDATES, MESSAGE_FETCH_WAIT};

use super::Hub;

/// Length of one round; rounds run back to back.
pub const ROUND_DURATION: Duration = Duration::from_secs(15);
/// Seconds counted down at the start of each round.
const COUNTDOWN_START_SECONDS: u64 = 10;
/// Grace period before winner selection, absorbing in-flight publishes.
const WINNER_SELECTION_DELAY: Duration = Duration::from_secs(1);
/// In-memory round buffers kept after each winner selection.
const KEEP_ROUNDS: usize = 3;

impl Hub {
    /// The first round starts immediately; every later tick ends the current
    /// round and starts the next, so rounds run back to back.
    pub(crate) async fn run_round_scheduler(self: Arc<Self>) {
        let mut ticker = interval(ROUND_DURATION);
        ticker.tick().await; // first tick completes immediately
        self.clone().start_round().await;
        loop {
            ticker.tick().await;
            self.clone().end_round().await;
            self.clone().start_round().await;
        }
    }

    async fn start_round(self: Arc<Self>) {
        let round_id = unix_now();
        {
            let mut state = self.state.lock().await;
            state.active = true;
            state.current_round_id = round_id;
            state.limiter.clear();
        }

        self.broadcast_envelope(&Envelope::round_start(round_id));
        let marker = RoundMarker {
            round_id,
            timestamp: unix_now(),
            status: RoundStatus::Started,
        };
        if let Err(e) = self.stream().publish_round_marker(&marker).await {
            error!(round_id, error = %e, "failed to publish round start");
        }

        tokio::spawn(self.clone().run_countdown(round_id));
        info!(round_id, "round started");
    }

    async fn end_round(self: Arc<Self>) {
        let round_id = {
            let mut state = self.state.lock().await;
            state.active = false;
            state.current_round_id
        };

        self.broadcast_envelope(&Envelope::round_end(round_id));
        let marker = RoundMarker {
            round_id,
            timestamp: unix_now(),
            status: RoundStatus::Ended,
        };
        if let Err(e) = self.stream().publish_round_marker(&marker).await {
            error!(round_id, error = %e, "failed to publish round end");
        }

        tokio::spawn(self.clone().select_winner(round_id));
        info!(round_id, "round ended");
    }

    /// Anchors round timing. The UI drives its own timer from `round_start`,
    /// so each tick only traces; the task exits as soon as the round it was
    /// spawned for is no longer the active one.
    async fn run_countdown(self: Arc<Self>, round_id: i64) {
        for remaining in (1..=COUNTDOWN_START_SECONDS).rev() {
            {
                let state = self.state.lock().await;
                if !state.active || state.current_round_id != round_id {
                    return;
                }
            }
            debug!(round_id, remaining, "countdown tick");
            sleep(Duration::from_secs(1)).await;
        }
    }

    /// Pick one submission uniformly at random and announce it. The
    /// in-memory buffer is authoritative; the stream is only consulted when
    /// the buffer has nothing for the round.
    pub(crate) async fn select_winner(self: Arc<Self>, round_id: i64) {
        sleep(WINNER_SELECTION_DELAY).await;

        let buffered = {
            let state = self.state.lock().await;
            state
                .round_messages
                .get(&round_id)
                .cloned()
                .unwrap_or_default()
        };

        if !buffered.is_empty() {
            let pick = &buffered[rand::thread_rng().gen_range(0..buffered.len())];
            self.announce_winner(round_id, &pick.username, &pick.content)
                .await;
        } else if self.stream().is_available() {
            match self
                .stream()
                .fetch_round_messages(round_id, MAX_WINNER_CANDIDATES, MESSAGE_FETCH_WAIT)
                .await
            {
                Ok(candidates) if !candidates.is_empty() => {
                    let pick = &candidates[rand::thread_rng().gen_range(0..candidates.len())];
                    self.announce_winner(round_id, &pick.username, &pick.content)
                        .await;
                }
                Ok(_) => self.announce_empty_round(round_id),
                Err(e) => {
                    error!(round_id, error = %e, "winner selection fetch failed");
                    self.broadcast_envelope(&Envelope::selected_text(
                        "Random winner selected for the round!",
                    ));
                }
            }
        } else {
            self.announce_empty_round(round_id);
        }

        self.cleanup_old_rounds().await;
    }

    async fn announce_winner(&self, round_id: i64, username: &str, content: &str) {
        let record = WinnerRecord {
            round_id,
            username: username.to_string(),
            content: content.to_string(),
            timestamp: unix_now(),
        };
        if let Err(e) = self.stream().publish_winner(&record).await {
            error!(round_id, error = %e, "failed to publish winner");
        }

        self.broadcast_envelope(&Envelope::selected_text(format!(
            "Winner: {} - {}",
            username, content
        )));
        info!(round_id, winner = %username, "winner selected");
    }

    fn announce_empty_round(&self, round_id: i64) {
        info!(round_id, "no messages submitted");
        self.broadcast_envelope(&Envelope::selected_text(
            "No messages submitted for this round.",
        ));
    }

    /// Drop buffers for all but the most recent rounds.
    async fn cleanup_old_rounds(&self) {
        let mut state = self.state.lock().await;
        if state.round_messages.len() <= KEEP_ROUNDS {
            return;
        }
        let mut ids: Vec<i64> = state.round_messages.keys().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        for stale in ids.split_off(KEEP_ROUNDS) {
            state.round_messages.remove(&stale);
        }
    }
}
