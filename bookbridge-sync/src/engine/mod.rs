//! Sync cycle engine
//!
//! One cycle pulls every configured client's position for a book, elects
//! the freshest as leader, translates its position into each follower's
//! coordinates and writes it back, suppressing the echoes those writes
//! will produce. At most one cycle runs per book at a time; different
//! books sync in parallel.

pub mod election;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use bookbridge_common::db::models::{BookStatus, ClientStateRow, Mapping};
use bookbridge_common::db::ProgressStore;
use bookbridge_common::events::{BridgeEvent, EventBus};
use bookbridge_common::{time, Result};

use crate::clients::{
    BulkStates, ClientName, ClientState, ErrorKind, Locator, SyncClient, UpdateRequest,
};
use crate::ebook::EbookCache;
use crate::suppress::WriteTracker;
use crate::translate::{LeaderPosition, Translator};
use election::{Candidate, DeltaPolicy};

/// Per-client bulk snapshots taken at the start of a full cycle
pub type BulkSnapshot = HashMap<ClientName, BulkStates>;

/// Consecutive full-failure count that flips a mapping to retry-later
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub struct SyncEngine {
    store: ProgressStore,
    clients: Vec<Arc<dyn SyncClient>>,
    translator: Translator,
    suppressor: Arc<WriteTracker>,
    events: EventBus,
    ebooks: Arc<EbookCache>,
    policy: DeltaPolicy,
    cycle_timeout: Duration,
    /// Per-book single-writer locks, created on demand
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Consecutive cycles where every follower write failed
    failures: Mutex<HashMap<String, u32>>,
    /// Which client led the previous successful cycle per book
    last_leader: Mutex<HashMap<String, ClientName>>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: ProgressStore,
        clients: Vec<Arc<dyn SyncClient>>,
        translator: Translator,
        suppressor: Arc<WriteTracker>,
        events: EventBus,
        ebooks: Arc<EbookCache>,
        policy: DeltaPolicy,
        cycle_timeout: Duration,
    ) -> Self {
        SyncEngine {
            store,
            clients,
            translator,
            suppressor,
            events,
            ebooks,
            policy,
            cycle_timeout,
            locks: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            last_leader: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    pub fn client(&self, name: ClientName) -> Option<&Arc<dyn SyncClient>> {
        self.clients.iter().find(|c| c.name() == name)
    }

    fn book_lock(&self, book_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(book_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn participants(&self, mapping: &Mapping) -> Vec<Arc<dyn SyncClient>> {
        self.clients
            .iter()
            .filter(|c| c.is_configured() && c.supports_mode(mapping.sync_mode))
            .cloned()
            .collect()
    }

    /// Verify connectivity of every configured client at startup
    pub async fn startup_checks(&self) {
        for client in &self.clients {
            if !client.is_configured() {
                info!(client = %client.name(), "Sync client disabled/unconfigured");
                continue;
            }
            match client.check_connection().await {
                Ok(()) => info!(client = %client.name(), "Connection verified"),
                Err(err) => warn!(client = %client.name(), %err, "Connection check failed"),
            }
        }
    }

    /// Bulk snapshots for clients that support them, once per full cycle
    pub async fn prefetch_bulk(&self) -> Arc<BulkSnapshot> {
        let mut snapshot = BulkSnapshot::new();
        for client in &self.clients {
            if !client.is_configured() {
                continue;
            }
            match client.fetch_bulk().await {
                Ok(Some(bulk)) => {
                    snapshot.insert(client.name(), bulk);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(client = %client.name(), %err, "Bulk prefetch failed");
                }
            }
        }
        Arc::new(snapshot)
    }

    /// Run one sync cycle for a book.
    ///
    /// Serialized per book; the whole cycle runs under a deadline. Writes
    /// already stamped in the suppressor before a timeout stay recorded.
    pub async fn sync_cycle(
        &self,
        book_id: &str,
        force: bool,
        bulk: Option<&BulkSnapshot>,
    ) -> Result<()> {
        let lock = self.book_lock(book_id);
        let _guard = lock.lock().await;

        match tokio::time::timeout(self.cycle_timeout, self.cycle_inner(book_id, force, bulk)).await
        {
            Ok(result) => result,
            Err(_) => {
                error!(book_id, "Sync cycle exceeded deadline, cancelled");
                self.note_full_failure(book_id).await;
                Ok(())
            }
        }
    }

    async fn cycle_inner(
        &self,
        book_id: &str,
        force: bool,
        bulk: Option<&BulkSnapshot>,
    ) -> Result<()> {
        let Some(mapping) = self.store.load_mapping(book_id).await? else {
            debug!(book_id, "No mapping, skipping cycle");
            return Ok(());
        };
        if mapping.status != BookStatus::Active {
            debug!(book_id, status = %mapping.status, "Mapping not active, skipping cycle");
            return Ok(());
        }

        info!(book_id, title = %mapping.title, "Sync cycle starting");

        let prev_rows: HashMap<String, ClientStateRow> = self
            .store
            .read_states(book_id)
            .await?
            .into_iter()
            .map(|row| (row.client_name.clone(), row))
            .collect();

        let participants = self.participants(&mapping);
        if participants.is_empty() {
            return Ok(());
        }

        // Parallel state fetch across all participating clients
        let mapping_ref = &mapping;
        let fetches = participants.iter().map(|client| {
            let prev = prev_rows.get(client.name().as_str());
            let client = client.clone();
            async move {
                let result = client
                    .fetch_state(mapping_ref, prev, bulk.and_then(|b| b.get(&client.name())))
                    .await;
                (client, result)
            }
        });
        let fetched = futures::future::join_all(fetches).await;

        let mut states: Vec<(Arc<dyn SyncClient>, ClientState)> = Vec::new();
        for (client, result) in fetched {
            match result {
                Ok(Some(state)) => {
                    // Echo suppression: our own recent write coming back
                    // counts as absent.
                    if self.suppressor.is_own_write(client.name(), book_id) {
                        debug!(book_id, client = %client.name(), "Suppressing own-write echo");
                        continue;
                    }
                    states.push((client, state));
                }
                Ok(None) => {}
                Err(err) if err.kind == ErrorKind::Fatal => {
                    error!(book_id, client = %client.name(), %err, "Fatal client error, aborting cycle");
                    self.note_full_failure(book_id).await;
                    return Ok(());
                }
                Err(err) => {
                    warn!(book_id, client = %client.name(), %err, "State fetch failed");
                }
            }
        }

        if states.is_empty() {
            debug!(book_id, "No client reported progress");
            return Ok(());
        }

        let text_len = mapping
            .ebook_filename
            .as_ref()
            .and_then(|f| self.ebooks.get(f).ok())
            .map(|parsed| parsed.text_len());

        let mut candidates = Vec::new();
        for (client, state) in &states {
            let Some(normalized) = state.normalized_pct(mapping.duration_seconds) else {
                debug!(book_id, client = %client.name(), "No normalized position (unknown duration)");
                continue;
            };
            let prev = prev_rows.get(client.name().as_str());
            candidates.push(Candidate {
                client: client.name(),
                state: state.clone(),
                normalized,
                previous: prev.and_then(|r| r.percentage),
                previous_ts: prev.and_then(|r| r.timestamp),
                can_lead: client.can_lead(),
            });
        }

        let contributors: Vec<Candidate> = if force {
            candidates.clone()
        } else {
            candidates
                .iter()
                .filter(|c| c.delta_exceeded(&self.policy, text_len))
                .cloned()
                .collect()
        };

        if contributors.is_empty() {
            debug!(book_id, "No client change exceeded its delta gate");
            self.events.emit_lossy(BridgeEvent::SyncCycleSkipped {
                book_id: book_id.to_string(),
                reason: "delta gate".into(),
                timestamp: time::now(),
            });
            return Ok(());
        }

        let Some(leader) = election::elect_leader(&contributors) else {
            warn!(book_id, "No client eligible to lead");
            return Ok(());
        };
        let leader = leader.clone();
        info!(
            book_id,
            leader = %leader.client,
            pct = leader.normalized,
            "Leader elected"
        );

        // Inter-client gate: everyone already agrees within tolerance.
        if !force {
            let follower_cached: Vec<f64> = prev_rows
                .values()
                .filter(|row| row.client_name != leader.client.as_str())
                .filter_map(|row| row.percentage)
                .collect();
            if !election::crosses_client_gate(
                leader.normalized,
                &follower_cached,
                self.policy.between_clients,
            ) {
                debug!(book_id, "Clients already in sync, skipping propagation");
                self.events.emit_lossy(BridgeEvent::SyncCycleSkipped {
                    book_id: book_id.to_string(),
                    reason: "between-clients gate".into(),
                    timestamp: time::now(),
                });
                return Ok(());
            }
        }

        // Anti-regression guard.
        let max_cached = prev_rows
            .values()
            .filter_map(|row| row.percentage)
            .fold(0.0_f64, f64::max);
        let same_source = self.last_leader.lock().get(book_id) == Some(&leader.client);
        if !election::regression_allowed(
            leader.normalized,
            max_cached,
            self.policy.regression_tolerance,
            same_source,
            force,
        ) {
            warn!(
                book_id,
                leader = %leader.client,
                pct = leader.normalized,
                max_cached,
                "Refusing backwards propagation from a new source"
            );
            self.events.emit_lossy(BridgeEvent::SyncCycleSkipped {
                book_id: book_id.to_string(),
                reason: "anti-regression".into(),
                timestamp: time::now(),
            });
            return Ok(());
        }

        // The leader's text anchors every translation.
        let leader_client = self
            .client(leader.client)
            .expect("leader came from registered clients");
        let snippet = match leader_client.text_at(&mapping, &leader.state).await {
            Ok(snippet) => snippet,
            Err(err) => {
                warn!(book_id, %err, "Leader text extraction failed");
                None
            }
        };
        let leader_position = LeaderPosition {
            client: leader.client,
            state: leader.state.clone(),
            percentage: leader.normalized,
            snippet,
        };

        // Fan out to followers; each failure is isolated.
        let mut attempted = 0usize;
        let mut updated = 0usize;
        for follower in &participants {
            if follower.name() == leader.client {
                continue;
            }

            let locator = match self
                .translator
                .translate(&mapping, &leader_position, follower.name())
            {
                Ok(Some(locator)) => locator,
                Ok(None) => {
                    warn!(
                        book_id,
                        follower = %follower.name(),
                        "Position not resolvable for follower, skipping"
                    );
                    continue;
                }
                Err(err) => {
                    warn!(book_id, follower = %follower.name(), %err, "Translation failed");
                    continue;
                }
            };

            attempted += 1;
            let request = UpdateRequest {
                locator: locator.clone(),
                snippet: leader_position.snippet.clone(),
                previous: prev_rows
                    .get(follower.name().as_str())
                    .and_then(|r| r.percentage),
            };

            match follower.update(&mapping, &request).await {
                Ok(outcome) => {
                    // Stamp before the result is visible anywhere else.
                    self.suppressor.record(follower.name(), book_id);

                    let row = ClientStateRow {
                        book_id: book_id.to_string(),
                        client_name: follower.name().as_str().to_string(),
                        last_updated: time::unix_now(),
                        percentage: outcome.percentage.or(Some(locator.percentage)),
                        timestamp: outcome.timestamp,
                        locator_json: outcome.locator_json,
                    };
                    self.store.write_state(&row).await?;
                    updated += 1;

                    self.events.emit_lossy(BridgeEvent::ProgressWritten {
                        book_id: book_id.to_string(),
                        client: follower.name().as_str().to_string(),
                        percentage: row.percentage.unwrap_or(0.0),
                        timestamp: time::now(),
                    });
                }
                Err(err) if err.kind == ErrorKind::NotConfigured => {
                    debug!(book_id, follower = %follower.name(), "Follower unconfigured for this book");
                    attempted -= 1;
                }
                Err(err) if err.kind == ErrorKind::Conflict => {
                    // Idempotent write already applied
                    debug!(book_id, follower = %follower.name(), %err, "Conflict treated as success");
                    self.suppressor.record(follower.name(), book_id);
                    updated += 1;
                }
                Err(err) => {
                    warn!(book_id, follower = %follower.name(), %err, "Follower update failed");
                }
            }
        }

        // Refresh the leader's own row from what it reported.
        let leader_row = ClientStateRow {
            book_id: book_id.to_string(),
            client_name: leader.client.as_str().to_string(),
            last_updated: time::unix_now(),
            percentage: Some(leader.normalized),
            timestamp: leader.state.audio_seconds(),
            locator_json: serde_json::to_string(&leader.state.position).ok(),
        };
        self.store.write_state(&leader_row).await?;
        self.last_leader
            .lock()
            .insert(book_id.to_string(), leader.client);

        if attempted > 0 && updated == 0 {
            self.note_full_failure(book_id).await;
        } else {
            self.failures.lock().remove(book_id);
            info!(book_id, updated, "Sync cycle completed");
            self.events.emit_lossy(BridgeEvent::SyncCycleCompleted {
                book_id: book_id.to_string(),
                leader: Some(leader.client.as_str().to_string()),
                followers_updated: updated,
                timestamp: time::now(),
            });
        }

        Ok(())
    }

    /// Count a cycle where every follower write failed; three in a row
    /// park the mapping for retry
    async fn note_full_failure(&self, book_id: &str) {
        let count = {
            let mut failures = self.failures.lock();
            let count = failures.entry(book_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        warn!(book_id, consecutive = count, "Full cycle failure");

        if count >= MAX_CONSECUTIVE_FAILURES {
            if let Err(err) = self
                .store
                .set_status(book_id, BookStatus::FailedRetryLater)
                .await
            {
                error!(book_id, %err, "Could not park failing mapping");
                return;
            }
            self.failures.lock().remove(book_id);
            self.events.emit_lossy(BridgeEvent::StatusChanged {
                book_id: book_id.to_string(),
                old_status: BookStatus::Active.to_string(),
                new_status: BookStatus::FailedRetryLater.to_string(),
                timestamp: time::now(),
            });
        }
    }

    /// Clear all progress for a book and reset every client to 0%.
    ///
    /// Runs under the book lock so it cannot interleave with a cycle. The
    /// mapping's status is left untouched; only position state is purged.
    pub async fn clear_progress(&self, book_id: &str) -> Result<serde_json::Value> {
        let lock = self.book_lock(book_id);
        let _guard = lock.lock().await;

        let Some(mapping) = self.store.load_mapping(book_id).await? else {
            return Err(bookbridge_common::Error::NotFound(format!(
                "mapping {book_id}"
            )));
        };

        info!(book_id, title = %mapping.title, "Clearing progress");

        let cleared = self.store.reset_state(book_id).await?;

        // Remove the KoSync document so its furthest-wins guard doesn't
        // resurrect the old position on the next device pull.
        if let Some(doc_id) = &mapping.kosync_doc_id {
            if self.store.delete_kosync_document(doc_id).await? {
                debug!(book_id, "Deleted KoSync document record");
            }
        }

        let zero = UpdateRequest {
            locator: Locator::from_percentage(0.0),
            snippet: None,
            previous: None,
        };
        let mut reset_results = serde_json::Map::new();
        for client in self.participants(&mapping) {
            let mut request = zero.clone();
            if client.name() == ClientName::Abs {
                request.locator.timestamp = Some(0.0);
            }
            let outcome = client.update(&mapping, &request).await;
            let ok = outcome.is_ok();
            if ok {
                self.suppressor.record(client.name(), book_id);
            }
            reset_results.insert(
                client.name().as_str().to_string(),
                serde_json::json!({ "success": ok }),
            );
        }

        Ok(serde_json::json!({
            "book_id": book_id,
            "states_cleared": cleared,
            "client_resets": reset_results,
        }))
    }
}
