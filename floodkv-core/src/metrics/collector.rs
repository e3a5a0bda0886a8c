//! Metrics collector implementation

use super::MetricsSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters for the store, updated via atomics
#[derive(Debug, Default)]
pub struct MetricsCollector {
    publications_received: AtomicU64,
    publications_sent: AtomicU64,
    keys_merged: AtomicU64,
    merge_drops: AtomicU64,
    keys_expired: AtomicU64,
    full_sync_successes: AtomicU64,
    full_sync_failures: AtomicU64,
    transport_failures: AtomicU64,
    floods_buffered: AtomicU64,
    looped_publications: AtomicU64,
    sync_duration_ms_sum: AtomicU64,
    sync_duration_count: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_publications_received(&self) {
        self.publications_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_publications_sent(&self) {
        self.publications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_keys_merged(&self, n: u64) {
        self.keys_merged.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_merge_drops(&self, n: u64) {
        self.merge_drops.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_keys_expired(&self, n: u64) {
        self.keys_expired.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_full_sync_success(&self) {
        self.full_sync_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_full_sync_failure(&self) {
        self.full_sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_transport_failures(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_floods_buffered(&self) {
        self.floods_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_looped_publications(&self) {
        self.looped_publications.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one completed initial sync
    pub fn observe_sync_duration_ms(&self, ms: u64) {
        self.sync_duration_ms_sum.fetch_add(ms, Ordering::Relaxed);
        self.sync_duration_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            publications_received: self.publications_received.load(Ordering::Relaxed),
            publications_sent: self.publications_sent.load(Ordering::Relaxed),
            keys_merged: self.keys_merged.load(Ordering::Relaxed),
            merge_drops: self.merge_drops.load(Ordering::Relaxed),
            keys_expired: self.keys_expired.load(Ordering::Relaxed),
            full_sync_successes: self.full_sync_successes.load(Ordering::Relaxed),
            full_sync_failures: self.full_sync_failures.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            floods_buffered: self.floods_buffered.load(Ordering::Relaxed),
            looped_publications: self.looped_publications.load(Ordering::Relaxed),
            sync_duration_ms_sum: self.sync_duration_ms_sum.load(Ordering::Relaxed),
            sync_duration_count: self.sync_duration_count.load(Ordering::Relaxed),
        }
    }
}
