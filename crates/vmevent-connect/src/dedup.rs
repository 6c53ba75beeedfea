//! Deduplication and ordering of polled batches
//!
//! Time-range polls are inclusive, so every event stamped with the previous cycle's
//! position comes back in the next one. Several events can share that timestamp, so the
//! whole set of ids processed at the position is dropped, not only the last one. Vendor
//! ids are not a sort key (concurrent events can carry ids out of time order); the batch
//! order as returned by the API is kept, only reversed.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::hash::Hash;

/// Outcome of preparing a polled batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared<T> {
    /// Nothing new since the previous cycle
    Idle,
    /// New events, oldest first
    Ready(Vec<T>),
}

/// Drop every occurrence of the already-processed event, keeping relative order
pub fn remove_seen<T, K, F>(batch: Vec<T>, seen: &K, key: F) -> Vec<T>
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    batch.into_iter().filter(|e| key(e) != *seen).collect()
}

/// Drop every event whose key is in `seen`, keeping relative order
pub fn remove_all_seen<T, K, F>(batch: Vec<T>, seen: &HashSet<K>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    batch.into_iter().filter(|e| !seen.contains(&key(e))).collect()
}

/// Reverse a newest-first batch into chronological order
pub fn into_chronological<T>(mut newest_first: Vec<T>) -> Vec<T> {
    newest_first.reverse();
    newest_first
}

/// Full treatment for a newest-first batch
///
/// Empty batches and batches holding only already-processed events are idle. Anything
/// else loses the processed events and comes back oldest first.
pub fn prepare_newest_first<T, K, F>(batch: Vec<T>, seen: &HashSet<K>, key: F) -> Prepared<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let fresh = remove_all_seen(batch, seen, key);
    if fresh.is_empty() {
        Prepared::Idle
    } else {
        Prepared::Ready(into_chronological(fresh))
    }
}

/// Time position of a poller plus the ids already processed at exactly that time
#[derive(Debug, Clone)]
pub struct Watermark<K> {
    position: i64,
    seen: HashSet<K>,
}

impl<K> Default for Watermark<K> {
    fn default() -> Self {
        Self {
            position: 0,
            seen: HashSet::new(),
        }
    }
}

impl<K: Eq + Hash> Watermark<K> {
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Ids processed at the current position
    pub fn seen(&self) -> &HashSet<K> {
        &self.seen
    }

    /// Record a processed event. A later timestamp moves the position and forgets the
    /// ids of the old one; an earlier timestamp changes nothing.
    pub fn record(&mut self, time: i64, key: K) {
        match time.cmp(&self.position) {
            Ordering::Greater => {
                self.position = time;
                self.seen.clear();
                self.seen.insert(key);
            }
            Ordering::Equal => {
                self.seen.insert(key);
            }
            Ordering::Less => {}
        }
    }
}
