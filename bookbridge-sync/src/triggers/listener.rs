//! Audiobook server event listener
//!
//! Holds a long-lived streaming connection to the audiobook server's event
//! channel and turns `user_item_progress_updated` frames into debounced
//! sync requests. Auth rejection disconnects cleanly and leaves the global
//! tick as the only trigger for ABS-side changes.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bookbridge_common::db::models::BookStatus;
use bookbridge_common::db::ProgressStore;

use super::{Debouncer, SyncDispatcher};
use crate::clients::ClientName;
use crate::suppress::WriteTracker;

/// Delay before reconnecting after a dropped stream
const RECONNECT_DELAY: Duration = Duration::from_secs(15);
/// How often the debounce pump checks for due books
const PUMP_INTERVAL: Duration = Duration::from_secs(5);

pub struct AbsEventListener {
    server_url: String,
    token: String,
    store: ProgressStore,
    dispatcher: SyncDispatcher,
    suppressor: Arc<WriteTracker>,
    debouncer: Arc<Debouncer>,
}

impl AbsEventListener {
    pub fn new(
        server_url: String,
        token: String,
        store: ProgressStore,
        dispatcher: SyncDispatcher,
        suppressor: Arc<WriteTracker>,
        debounce_window: Duration,
    ) -> Self {
        AbsEventListener {
            server_url,
            token,
            store,
            dispatcher,
            suppressor,
            debouncer: Arc::new(Debouncer::new(debounce_window)),
        }
    }

    /// Connect and consume events until cancelled.
    ///
    /// Returns normally when auth is rejected; the caller does not retry
    /// in that case.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        // Debounce pump: fires sync cycles once a book's burst quiets down.
        let pump = {
            let listener = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(PUMP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => listener.fire_due().await,
                    }
                }
            })
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.listen_once(&cancel).await {
                ListenOutcome::AuthRejected => {
                    warn!("Event stream auth rejected; falling back to periodic sync only");
                    break;
                }
                ListenOutcome::Disconnected => {
                    debug!("Event stream disconnected, reconnecting");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
                ListenOutcome::Cancelled => break,
            }
        }

        pump.abort();
        info!("Event listener stopped");
    }

    async fn listen_once(&self, cancel: &CancellationToken) -> ListenOutcome {
        let url = format!("{}/api/events/stream", self.server_url);
        info!(url = %url, "Connecting to event stream");

        let client = match reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                warn!(%err, "Could not build stream client");
                return ListenOutcome::Disconnected;
            }
        };

        let response = match client.get(&url).bearer_auth(&self.token).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "Event stream connection failed");
                return ListenOutcome::Disconnected;
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return ListenOutcome::AuthRejected;
        }
        if !status.is_success() {
            warn!(%status, "Event stream returned error status");
            return ListenOutcome::Disconnected;
        }

        info!("Event stream connected");

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return ListenOutcome::Cancelled,
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else {
                return ListenOutcome::Disconnected;
            };
            let Ok(bytes) = chunk else {
                return ListenOutcome::Disconnected;
            };

            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                self.handle_line(line.trim()).await;
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        // Frames arrive as `event-name {json}` or SSE-style `data: {json}`
        let payload = line
            .strip_prefix("data:")
            .map(str::trim)
            .unwrap_or(line);
        if payload.is_empty() {
            return;
        }
        let Ok(frame) = serde_json::from_str::<Value>(payload) else {
            return;
        };

        let event_name = frame
            .get("name")
            .or_else(|| frame.get("event"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if event_name != "user_item_progress_updated" {
            return;
        }

        // The book id lives in the nested data payload on current servers,
        // at the top level on older ones.
        let item_id = frame
            .pointer("/data/libraryItemId")
            .or_else(|| frame.pointer("/data/mediaItemId"))
            .or_else(|| frame.get("libraryItemId"))
            .and_then(|v| v.as_str());
        let Some(item_id) = item_id else {
            debug!("Progress event without an item id, ignoring");
            return;
        };

        match self.store.load_mapping(item_id).await {
            Ok(Some(mapping)) if mapping.status == BookStatus::Active => {
                debug!(book_id = item_id, "Progress event recorded");
                self.debouncer.note(item_id);
            }
            Ok(Some(_)) => {
                debug!(book_id = item_id, "Progress event for inactive mapping, ignoring");
            }
            Ok(None) => {
                debug!(book_id = item_id, "Progress event for unmapped book");
            }
            Err(err) => {
                warn!(book_id = item_id, %err, "Mapping lookup failed for event");
            }
        }
    }

    /// Fire sync cycles for books whose debounce window has elapsed
    async fn fire_due(&self) {
        for book_id in self.debouncer.take_due() {
            if self.suppressor.is_own_write(ClientName::Abs, &book_id) {
                debug!(book_id, "Ignoring self-triggered event");
                continue;
            }
            info!(book_id, "Progress changed upstream, triggering sync");
            self.dispatcher.enqueue(&book_id);
        }
    }
}

enum ListenOutcome {
    AuthRejected,
    Disconnected,
    Cancelled,
}
