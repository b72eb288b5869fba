//! Write-suppression tracker for self-triggered feedback loops
//!
//! The engine calls [`WriteTracker::record`] after every successful push
//! to a client; trigger sources call [`WriteTracker::is_own_write`] before
//! acting on an inbound progress change so round-trip echoes are dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clients::ClientName;

/// Default suppression window
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StampKey {
    client: ClientName,
    book_id: String,
}

/// Process-wide record of recent outgoing writes
pub struct WriteTracker {
    stamps: Mutex<HashMap<StampKey, Instant>>,
    ttl: Duration,
}

impl WriteTracker {
    pub fn new(ttl: Duration) -> Self {
        WriteTracker {
            stamps: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Stamp an outgoing write. Call before releasing the write result to
    /// any observer, so an echo can never race past the stamp.
    pub fn record(&self, client: ClientName, book_id: &str) {
        let mut stamps = self.stamps.lock();
        stamps.insert(
            StampKey {
                client,
                book_id: book_id.to_string(),
            },
            Instant::now(),
        );
    }

    /// Is an inbound event for this client/book our own echo?
    ///
    /// Expired entries are evicted lazily while the lock is held.
    pub fn is_own_write(&self, client: ClientName, book_id: &str) -> bool {
        let mut stamps = self.stamps.lock();
        let now = Instant::now();

        let own = stamps
            .get(&StampKey {
                client,
                book_id: book_id.to_string(),
            })
            .is_some_and(|stamped| now.duration_since(*stamped) < self.ttl);

        stamps.retain(|_, stamped| now.duration_since(*stamped) < self.ttl);
        own
    }
}

impl Default for WriteTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_suppresses_within_ttl() {
        let tracker = WriteTracker::new(Duration::from_millis(80));
        tracker.record(ClientName::Abs, "book-1");

        assert!(tracker.is_own_write(ClientName::Abs, "book-1"));
        assert!(!tracker.is_own_write(ClientName::Abs, "book-2"));
        assert!(!tracker.is_own_write(ClientName::KoReaderSync, "book-1"));

        std::thread::sleep(Duration::from_millis(100));
        assert!(!tracker.is_own_write(ClientName::Abs, "book-1"));
    }

    #[test]
    fn expired_stamps_are_evicted() {
        let tracker = WriteTracker::new(Duration::from_millis(20));
        tracker.record(ClientName::Abs, "book-1");
        tracker.record(ClientName::Storyteller, "book-2");

        std::thread::sleep(Duration::from_millis(40));
        assert!(!tracker.is_own_write(ClientName::Abs, "book-1"));
        assert!(tracker.stamps.lock().is_empty());
    }

    #[test]
    fn re_record_extends_window() {
        let tracker = WriteTracker::new(Duration::from_millis(60));
        tracker.record(ClientName::Booklore, "book-1");
        std::thread::sleep(Duration::from_millis(40));
        tracker.record(ClientName::Booklore, "book-1");
        std::thread::sleep(Duration::from_millis(40));
        assert!(tracker.is_own_write(ClientName::Booklore, "book-1"));
    }
}
