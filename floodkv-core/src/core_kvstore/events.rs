/*
    events.rs - typed events crossing the store boundary

    The link monitor feeds peer membership changes in; the store emits
    sync completions out. Both ride bounded channels owned by the
    supervisor.
*/

use std::collections::HashMap;
use std::time::Duration;

use super::publication::PeerSpec;

/// Peer membership change from the link monitor, routed to one area
#[derive(Debug, Clone, Default)]
pub struct PeerEvent {
    /// Area the change applies to
    pub area: String,

    /// Peers to add or update, by node name
    pub peers_to_add: HashMap<String, PeerSpec>,

    /// Peers to remove, by node name
    pub peers_to_del: Vec<String>,
}

/// Emitted when a peer finishes its initial full sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvStoreSyncEvent {
    /// Peer that completed the sync
    pub node_name: String,

    /// Area the sync ran in
    pub area: String,

    /// Wall time from request to merged response
    pub duration: Duration,
}
