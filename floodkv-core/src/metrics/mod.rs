//! Metrics subsystem: process-wide atomic counters and snapshots
//!
//! Areas and the supervisor bump counters through a shared
//! [`MetricsCollector`]; a periodic supervisor tick takes a
//! [`MetricsSnapshot`] and logs it. There is no exporter here;
//! telemetry submission lives outside the store.

mod collector;

pub use collector::MetricsCollector;

/// Point-in-time copy of every store counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub publications_received: u64,
    pub publications_sent: u64,
    pub keys_merged: u64,
    pub merge_drops: u64,
    pub keys_expired: u64,
    pub full_sync_successes: u64,
    pub full_sync_failures: u64,
    pub transport_failures: u64,
    pub floods_buffered: u64,
    pub looped_publications: u64,
    pub sync_duration_ms_sum: u64,
    pub sync_duration_count: u64,
}

impl MetricsSnapshot {
    /// Mean initial-sync duration, if any sync completed
    pub fn avg_sync_duration_ms(&self) -> Option<u64> {
        if self.sync_duration_count == 0 {
            None
        } else {
            Some(self.sync_duration_ms_sum / self.sync_duration_count)
        }
    }
}
