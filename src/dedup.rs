//! Duplicate detection for incoming user messages.
//!
//! The store answers "have I seen this MessageId?" with an atomic
//! check-and-insert. A message id is first reserved as in progress and only
//! becomes a duplicate once the receipt bytes for it are stored; a failed
//! attempt releases the reservation so the sender's retry is processed again.
//! Processed ids are forgotten after a retention period.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default time a processed message id is remembered.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(10 * 60);

/// Outcome of reserving a message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First time seen; the caller now owns the reservation
    New,
    /// Already processed; the response previously sent
    Duplicate(Vec<u8>),
    /// Another request is processing this id right now
    InProgress,
}

/// Message id store with cached responses.
pub trait MessageIdStore: Send + Sync {
    /// Atomically reserve `message_id` unless it is known.
    fn try_begin(&self, message_id: &str) -> DedupOutcome;

    /// Mark `message_id` as processed, caching the response sent for it.
    fn complete(&self, message_id: &str, response: Vec<u8>);

    /// Release a reservation after a failed attempt.
    fn abort(&self, message_id: &str);
}

#[derive(Debug)]
enum Entry {
    InProgress,
    Done { response: Vec<u8>, at: Instant },
}

/// In-memory store.
///
/// Completed entries older than the retention period are purged on the next
/// `try_begin`; reservations in progress are never purged.
#[derive(Debug)]
pub struct InMemoryMessageIdStore {
    entries: Mutex<HashMap<String, Entry>>,
    retention: Duration,
}

impl Default for InMemoryMessageIdStore {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl InMemoryMessageIdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Number of tracked ids.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl MessageIdStore for InMemoryMessageIdStore {
    fn try_begin(&self, message_id: &str) -> DedupOutcome {
        let mut entries = self.entries.lock();
        let retention = self.retention;
        entries.retain(|_, entry| match entry {
            Entry::Done { at, .. } => at.elapsed() < retention,
            Entry::InProgress => true,
        });

        match entries.get(message_id) {
            Some(Entry::Done { response, .. }) => DedupOutcome::Duplicate(response.clone()),
            Some(Entry::InProgress) => DedupOutcome::InProgress,
            None => {
                entries.insert(message_id.to_string(), Entry::InProgress);
                DedupOutcome::New
            }
        }
    }

    fn complete(&self, message_id: &str, response: Vec<u8>) {
        self.entries
            .lock()
            .insert(
                message_id.to_string(),
                Entry::Done {
                    response,
                    at: Instant::now(),
                },
            );
    }

    fn abort(&self, message_id: &str) {
        let mut entries = self.entries.lock();
        if matches!(entries.get(message_id), Some(Entry::InProgress)) {
            entries.remove(message_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_check_and_insert() {
        let store = InMemoryMessageIdStore::new();
        assert_eq!(store.try_begin("m1"), DedupOutcome::New);
        assert_eq!(store.try_begin("m1"), DedupOutcome::InProgress);

        store.complete("m1", b"receipt".to_vec());
        assert_eq!(store.try_begin("m1"), DedupOutcome::Duplicate(b"receipt".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_abort_releases_reservation() {
        let store = InMemoryMessageIdStore::new();
        assert_eq!(store.try_begin("m1"), DedupOutcome::New);
        store.abort("m1");
        assert!(store.is_empty());
        assert_eq!(store.try_begin("m1"), DedupOutcome::New);
    }

    #[test]
    fn test_abort_keeps_completed() {
        let store = InMemoryMessageIdStore::new();
        store.try_begin("m1");
        store.complete("m1", b"r".to_vec());
        store.abort("m1");
        assert_eq!(store.try_begin("m1"), DedupOutcome::Duplicate(b"r".to_vec()));
    }

    #[test]
    fn test_expired_entry_is_accepted_again() {
        let store = InMemoryMessageIdStore::with_retention(Duration::ZERO);
        assert_eq!(store.try_begin("m1"), DedupOutcome::New);
        store.complete("m1", b"r".to_vec());
        assert_eq!(store.len(), 1);

        assert_eq!(store.try_begin("m1"), DedupOutcome::New);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expiry_purges_other_ids() {
        let store = InMemoryMessageIdStore::with_retention(Duration::from_millis(20));
        for id in ["m1", "m2", "m3"] {
            store.try_begin(id);
            store.complete(id, b"r".to_vec());
        }
        store.try_begin("pending");
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(store.try_begin("m4"), DedupOutcome::New);
        // Only the reservations survive
        assert_eq!(store.len(), 2);
        assert_eq!(store.try_begin("pending"), DedupOutcome::InProgress);
    }

    #[test]
    fn test_retained_entry_is_duplicate() {
        let store = InMemoryMessageIdStore::with_retention(Duration::from_secs(3600));
        store.try_begin("m1");
        store.complete("m1", b"r".to_vec());
        assert_eq!(store.try_begin("m1"), DedupOutcome::Duplicate(b"r".to_vec()));
    }

    #[test]
    fn test_concurrent_begin_single_winner() {
        let store = Arc::new(InMemoryMessageIdStore::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.try_begin("same-id"))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == DedupOutcome::New)
            .count();
        assert_eq!(winners, 1);
    }
}
