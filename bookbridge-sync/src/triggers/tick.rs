//! Global sync tick
//!
//! The safety net under the push and poll triggers: every period, take
//! bulk snapshots, run the suggestion scan, and queue a cycle for every
//! active mapping.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SyncDispatcher;
use crate::engine::SyncEngine;
use crate::suggest::SuggestionScanner;

pub struct GlobalTick {
    engine: Arc<SyncEngine>,
    dispatcher: SyncDispatcher,
    suggestions: Option<Arc<SuggestionScanner>>,
    period: Duration,
}

impl GlobalTick {
    pub fn new(
        engine: Arc<SyncEngine>,
        dispatcher: SyncDispatcher,
        suggestions: Option<Arc<SuggestionScanner>>,
        period: Duration,
    ) -> Self {
        GlobalTick {
            engine,
            dispatcher,
            suggestions,
            period,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(period_secs = self.period.as_secs(), "Global sync tick started");
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.tick_once().await,
            }
        }
        info!("Global sync tick stopped");
    }

    async fn tick_once(&self) {
        let active = match self.engine.store().list_active_mappings().await {
            Ok(active) => active,
            Err(err) => {
                warn!(%err, "Could not list active mappings");
                return;
            }
        };
        if active.is_empty() {
            debug!("No active mappings to sync");
        }

        let bulk = self.engine.prefetch_bulk().await;

        if let Some(scanner) = &self.suggestions {
            scanner.scan(&bulk).await;
        }

        debug!(books = active.len(), "Queueing periodic sync cycles");
        for mapping in active {
            self.dispatcher.enqueue_with_bulk(&mapping.book_id, bulk.clone());
        }
    }
}
