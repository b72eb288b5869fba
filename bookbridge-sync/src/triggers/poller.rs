//! Per-client polling worker
//!
//! Clients configured for `custom` poll mode get a dedicated worker that
//! compares their live position to the cached one in the progress store
//! and enqueues a targeted sync on change. Comparing against the store
//! rather than process memory means movement that happened while the
//! bridge was down still registers as a delta on the first poll after a
//! restart. Clients in `global` mode are covered by the tick.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SyncDispatcher;
use crate::clients::{ClientName, SyncClient};
use crate::engine::SyncEngine;
use crate::suppress::WriteTracker;

/// Minimum position change a poll acts on
const POLL_CHANGE_MIN: f64 = 0.001;

pub struct ClientPoller {
    client: Arc<dyn SyncClient>,
    interval: Duration,
    engine: Arc<SyncEngine>,
    dispatcher: SyncDispatcher,
    suppressor: Arc<WriteTracker>,
}

impl ClientPoller {
    pub fn new(
        client: Arc<dyn SyncClient>,
        interval: Duration,
        engine: Arc<SyncEngine>,
        dispatcher: SyncDispatcher,
        suppressor: Arc<WriteTracker>,
    ) -> Self {
        ClientPoller {
            client,
            interval,
            engine,
            dispatcher,
            suppressor,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            client = %self.client.name(),
            interval_secs = self.interval.as_secs(),
            "Per-client poller started"
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.poll_once().await {
                        debug!(client = %self.client.name(), %err, "Poll cycle error");
                    }
                }
            }
        }
        info!(client = %self.client.name(), "Per-client poller stopped");
    }

    async fn poll_once(&self) -> bookbridge_common::Result<()> {
        if !self.client.is_configured() {
            return Ok(());
        }

        let name = self.client.name();
        let active = self.engine.store().list_active_mappings().await?;
        let mut checked = 0usize;

        for mapping in &active {
            let state = match self.client.fetch_state(mapping, None, None).await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(err) => {
                    debug!(
                        client = %name,
                        book_id = %mapping.book_id,
                        %err,
                        "Poll fetch failed"
                    );
                    continue;
                }
            };

            let Some(current) = state.normalized_pct(mapping.duration_seconds) else {
                continue;
            };
            checked += 1;

            // The reference point is the durable per-client row, so a
            // move made while the bridge was down still counts.
            let cached = self
                .engine
                .store()
                .read_state(&mapping.book_id, name.as_str())
                .await?
                .and_then(|row| row.percentage)
                .unwrap_or(0.0);

            if (current - cached).abs() > POLL_CHANGE_MIN {
                if self.suppressor.is_own_write(name, &mapping.book_id) {
                    debug!(
                        client = %name,
                        book_id = %mapping.book_id,
                        "Ignoring self-triggered poll change"
                    );
                    continue;
                }
                info!(
                    client = %name,
                    book_id = %mapping.book_id,
                    from = cached,
                    to = current,
                    "Poll detected movement, triggering sync"
                );
                self.dispatcher.enqueue(&mapping.book_id);
            }
        }

        debug!(client = %name, checked, total = active.len(), "Poll cycle complete");
        Ok(())
    }
}

/// Spawn pollers for every client configured in custom poll mode
pub fn spawn_pollers(
    pollers: Vec<(ClientName, Duration)>,
    engine: &Arc<SyncEngine>,
    dispatcher: &SyncDispatcher,
    suppressor: &Arc<WriteTracker>,
    cancel: &CancellationToken,
) {
    for (name, interval) in pollers {
        let Some(client) = engine.client(name).cloned() else {
            warn!(client = %name, "Poll requested for unregistered client");
            continue;
        };
        let poller = Arc::new(ClientPoller::new(
            client,
            interval,
            engine.clone(),
            dispatcher.clone(),
            suppressor.clone(),
        ));
        tokio::spawn(poller.run(cancel.clone()));
    }
}
