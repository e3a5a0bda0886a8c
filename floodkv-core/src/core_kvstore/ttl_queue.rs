/*
    ttl_queue.rs - countdown queue for record expiry

    A min-heap keyed on expiry time drives a single timer per area.
    Entries are immutable once pushed: a refresh or overwrite pushes a
    new entry and the superseded one becomes stale. Staleness is
    detected on pop by re-checking the live record against the entry's
    (version, ttlVersion, originator), so the heap may transiently hold
    more entries than there are live records.

    Records with an infinite TTL are never enqueued.
*/

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use super::value::Value;

/// One pending expiry for a (key, version, ttlVersion, originator) tuple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlCountdownEntry {
    pub expiry_time: Instant,
    pub key: String,
    pub version: i64,
    pub ttl_version: i64,
    pub originator_id: String,
}

impl TtlCountdownEntry {
    /// Whether this entry still describes the live record
    pub fn matches(&self, value: &Value) -> bool {
        self.version == value.version
            && self.ttl_version == value.ttl_version
            && self.originator_id == value.originator_id
    }
}

impl Ord for TtlCountdownEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap (soonest expiry first)
        other
            .expiry_time
            .cmp(&self.expiry_time)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for TtlCountdownEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending expiries for one area
#[derive(Debug, Default)]
pub struct TtlCountdownQueue {
    heap: BinaryHeap<TtlCountdownEntry>,
}

impl TtlCountdownQueue {
    pub fn new() -> Self {
        TtlCountdownQueue { heap: BinaryHeap::new() }
    }

    /// Enqueue an expiry for an accepted record. Immortal records are skipped.
    pub fn push(&mut self, key: &str, value: &Value, now: Instant) {
        if value.is_immortal() || value.ttl_ms <= 0 {
            return;
        }
        self.heap.push(TtlCountdownEntry {
            expiry_time: now + Duration::from_millis(value.ttl_ms as u64),
            key: key.to_string(),
            version: value.version,
            ttl_version: value.ttl_version,
            originator_id: value.originator_id.clone(),
        });
    }

    /// The soonest pending expiry, if any
    pub fn earliest_expiry(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.expiry_time)
    }

    /// Pop every entry whose expiry is at or before `now`.
    ///
    /// The caller is responsible for discarding entries that no longer
    /// match the live record.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TtlCountdownEntry> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.expiry_time <= now {
                expired.push(self.heap.pop().unwrap());
            } else {
                break;
            }
        }
        expired
    }

    /// Remaining lifetime of the live record, if this queue still holds a
    /// matching entry. Scans the heap; the queue is area-local and small
    /// relative to flood traffic.
    pub fn remaining_ttl(&self, key: &str, value: &Value, now: Instant) -> Option<Duration> {
        self.heap
            .iter()
            .filter(|e| e.key == key && e.matches(value))
            .map(|e| e.expiry_time)
            .max()
            .map(|expiry| expiry.saturating_duration_since(now))
    }

    /// Number of entries, stale ones included
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
