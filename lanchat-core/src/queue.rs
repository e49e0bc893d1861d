//! Offline queue: per-destination backlog of messages that failed immediate delivery.
//!
//! Items are keyed by `(destination, sequence)`; a destination's items always drain in
//! ascending sequence regardless of the order they were queued in.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// A message waiting for its destination to become reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub destination: String,
    pub content: String,
    pub sequence: u64,
}

/// Persisted form: destination -> items in ascending sequence.
pub type QueueSnapshot = BTreeMap<String, Vec<QueuedMessage>>;

#[derive(Debug, Default)]
pub struct OfflineQueue {
    entries: HashMap<String, BTreeMap<u64, QueuedMessage>>,
    draining: HashSet<String>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `msg`. Returns false if `(destination, sequence)` is already queued.
    pub fn enqueue(&mut self, msg: QueuedMessage) -> bool {
        let items = self.entries.entry(msg.destination.clone()).or_default();
        if items.contains_key(&msg.sequence) {
            return false;
        }
        items.insert(msg.sequence, msg);
        true
    }

    /// Queued items for `destination`, ascending by sequence.
    pub fn pending(&self, destination: &str) -> Vec<QueuedMessage> {
        self.entries
            .get(destination)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove exactly one item. Returns it if it was queued.
    pub fn remove(&mut self, destination: &str, sequence: u64) -> Option<QueuedMessage> {
        let items = self.entries.get_mut(destination)?;
        let removed = items.remove(&sequence);
        if items.is_empty() {
            self.entries.remove(destination);
        }
        removed
    }

    /// Start a drain pass for `destination`.
    ///
    /// Returns the items to attempt, in order. Returns None when nothing is queued or a
    /// drain for this destination is already running; the caller must call
    /// `finish_drain` after a Some.
    pub fn begin_drain(&mut self, destination: &str) -> Option<Vec<QueuedMessage>> {
        if self.draining.contains(destination) {
            return None;
        }
        let items = self.pending(destination);
        if items.is_empty() {
            return None;
        }
        self.draining.insert(destination.to_string());
        Some(items)
    }

    pub fn finish_drain(&mut self, destination: &str) {
        self.draining.remove(destination);
    }

    pub fn is_draining(&self, destination: &str) -> bool {
        self.draining.contains(destination)
    }

    /// Total queued items across all destinations.
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn destinations(&self) -> Vec<String> {
        let mut out: Vec<String> = self.entries.keys().cloned().collect();
        out.sort();
        out
    }

    /// Highest sequence queued for any destination.
    pub fn max_sequence(&self) -> Option<u64> {
        self.entries
            .values()
            .filter_map(|items| items.keys().next_back().copied())
            .max()
    }

    pub fn to_snapshot(&self) -> QueueSnapshot {
        self.entries
            .iter()
            .map(|(dest, items)| (dest.clone(), items.values().cloned().collect()))
            .collect()
    }

    /// Rebuild from a persisted snapshot. The map key is authoritative for each item's
    /// destination; duplicate sequences keep the first occurrence.
    pub fn from_snapshot(snapshot: QueueSnapshot) -> Self {
        let mut queue = Self::new();
        for (destination, items) in snapshot {
            for mut item in items {
                item.destination = destination.clone();
                queue.enqueue(item);
            }
        }
        queue
    }
}
