/*
    peer.rs - per-peer sync state machine

    A peer walks IDLE -> INITIALIZED -> SYNCED. The full-dump request
    is issued on promotion to INITIALIZED; its response promotes to
    SYNCED; any transport failure demotes to IDLE with exponential
    backoff. Keys that change while a peer is mid-sync are parked in
    `pending_init_keys` and flooded to it once the sync lands, so the
    peer does not miss updates raced against its own dump.
*/

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::info;

use super::backoff::ExponentialBackoff;
use super::publication::PeerSpec;

/// Initial retry delay after a peer transport failure
pub const BACKOFF_INITIAL: Duration = Duration::from_millis(64);

/// Retry delay ceiling
pub const BACKOFF_MAX: Duration = Duration::from_millis(8192);

/// Initial cap on concurrently running full syncs; doubles per success
pub const PARALLEL_SYNC_LIMIT_INITIAL: usize = 2;

/// Hard cap on concurrently running full syncs
pub const PARALLEL_SYNC_LIMIT_MAX: usize = 32;

/// Sync lifecycle state of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PeerState {
    /// Known but not yet syncing; waiting for the scan timer and backoff
    Idle,
    /// Full-dump request in flight
    Initialized,
    /// Steady state; receives floods
    Synced,
}

/// Events driving the peer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSyncEvent {
    PeerAdd,
    SyncRespRcvd,
    TransportError,
}

/// State transition table. Total: every (state, event) pair maps somewhere.
pub fn next_state(current: PeerState, event: PeerSyncEvent) -> PeerState {
    match (current, event) {
        (_, PeerSyncEvent::PeerAdd) => PeerState::Idle,
        (_, PeerSyncEvent::TransportError) => PeerState::Idle,
        (PeerState::Initialized, PeerSyncEvent::SyncRespRcvd) => PeerState::Synced,
        // a late response to a peer no longer waiting changes nothing
        (state, PeerSyncEvent::SyncRespRcvd) => state,
    }
}

/// Everything the store tracks about one peer
#[derive(Debug)]
pub struct KvStorePeer {
    /// Peer node name, unique within the area
    pub node_name: String,

    /// Transport coordinates; may be updated on re-add
    pub spec: PeerSpec,

    /// Current sync state
    pub state: PeerState,

    /// Retry schedule, independent per peer
    pub backoff: ExponentialBackoff,

    /// Keys updated while this peer's initial sync was in flight
    pub pending_init_keys: HashSet<String>,

    /// When the in-flight full sync was requested
    pub sync_started_at: Option<Instant>,
}

impl KvStorePeer {
    pub fn new(node_name: impl Into<String>, spec: PeerSpec) -> Self {
        KvStorePeer {
            node_name: node_name.into(),
            spec,
            state: PeerState::Idle,
            backoff: ExponentialBackoff::new(BACKOFF_INITIAL, BACKOFF_MAX),
            pending_init_keys: HashSet::new(),
            sync_started_at: None,
        }
    }

    /// Apply an event and log the transition when the state changes
    pub fn transition(&mut self, event: PeerSyncEvent, area: &str) -> PeerState {
        let old = self.state;
        let new = next_state(old, event);
        if old != new {
            info!(
                area = %area,
                peer = %self.node_name,
                from = ?old,
                to = ?new,
                event = ?event,
                "peer state transition"
            );
        }
        self.state = new;
        new
    }
}
