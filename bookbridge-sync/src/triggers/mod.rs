//! Trigger layer
//!
//! Three trigger sources (the event listener, per-client pollers and the
//! global tick) converge on one queue keyed by book id. Enqueues
//! coalesce: while a book is already queued, further requests for it are
//! dropped; per-book serialization inside the engine handles the rest.

pub mod listener;
pub mod poller;
pub mod tick;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::{BulkSnapshot, SyncEngine};

#[derive(Clone)]
struct SyncRequest {
    book_id: String,
    force: bool,
    bulk: Option<Arc<BulkSnapshot>>,
}

/// Coalescing sync queue with a worker pool
#[derive(Clone)]
pub struct SyncDispatcher {
    tx: mpsc::UnboundedSender<SyncRequest>,
    queued: Arc<Mutex<HashSet<String>>>,
}

impl SyncDispatcher {
    /// Create the dispatcher and spawn `workers` consumer tasks
    pub fn start(
        engine: Arc<SyncEngine>,
        workers: usize,
        cancel: CancellationToken,
    ) -> SyncDispatcher {
        let (tx, rx) = mpsc::unbounded_channel::<SyncRequest>();
        let queued: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_id in 0..workers.max(1) {
            let engine = engine.clone();
            let queued = queued.clone();
            let rx = rx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let request = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            request = rx.recv() => request,
                        }
                    };
                    let Some(request) = request else { break };
                    queued.lock().remove(&request.book_id);

                    if let Err(err) = engine
                        .sync_cycle(&request.book_id, request.force, request.bulk.as_deref())
                        .await
                    {
                        error!(
                            worker_id,
                            book_id = %request.book_id,
                            %err,
                            "Sync cycle errored"
                        );
                    }
                }
                debug!(worker_id, "Sync worker stopped");
            });
        }

        info!(workers, "Sync dispatcher started");
        SyncDispatcher { tx, queued }
    }

    /// Queue a cycle for a book; duplicates coalesce while queued
    pub fn enqueue(&self, book_id: &str) {
        self.enqueue_inner(book_id, false, None)
    }

    pub fn enqueue_forced(&self, book_id: &str) {
        self.enqueue_inner(book_id, true, None)
    }

    pub fn enqueue_with_bulk(&self, book_id: &str, bulk: Arc<BulkSnapshot>) {
        self.enqueue_inner(book_id, false, Some(bulk))
    }

    fn enqueue_inner(&self, book_id: &str, force: bool, bulk: Option<Arc<BulkSnapshot>>) {
        {
            let mut queued = self.queued.lock();
            if !queued.insert(book_id.to_string()) {
                debug!(book_id, "Coalesced duplicate sync request");
                return;
            }
        }
        let request = SyncRequest {
            book_id: book_id.to_string(),
            force,
            bulk,
        };
        if self.tx.send(request).is_err() {
            self.queued.lock().remove(book_id);
        }
    }
}

/// Per-book quiet-period coalescing for bursty event sources
///
/// Each event resets the book's timer; the book becomes due once no new
/// event has arrived for a full window.
pub struct Debouncer {
    window: Duration,
    pending: Mutex<HashMap<String, Instant>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Debouncer {
            window,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Record an event, starting or resetting the book's quiet period
    pub fn note(&self, book_id: &str) {
        self.pending
            .lock()
            .insert(book_id.to_string(), Instant::now());
    }

    /// Books whose quiet period has elapsed; removed from the pending set
    pub fn take_due(&self) -> Vec<String> {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let due: Vec<String> = pending
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= self.window)
            .map(|(book_id, _)| book_id.clone())
            .collect();
        for book_id in &due {
            pending.remove(book_id);
        }
        due
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debouncer_waits_for_quiet_period() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        debouncer.note("book-1");
        assert!(debouncer.take_due().is_empty());

        std::thread::sleep(Duration::from_millis(30));
        // A new event resets the window.
        debouncer.note("book-1");
        assert!(debouncer.take_due().is_empty());

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(debouncer.take_due(), vec!["book-1".to_string()]);
        // Taken exactly once.
        assert!(debouncer.take_due().is_empty());
    }

    #[test]
    fn debouncer_tracks_books_independently() {
        let debouncer = Debouncer::new(Duration::from_millis(30));
        debouncer.note("a");
        debouncer.note("b");
        std::thread::sleep(Duration::from_millis(40));
        let mut due = debouncer.take_due();
        due.sort();
        assert_eq!(due, vec!["a".to_string(), "b".to_string()]);
    }
}
