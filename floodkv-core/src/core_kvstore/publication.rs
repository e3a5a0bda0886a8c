/*
    publication.rs - canonical envelopes exchanged between stores

    The Publication is the one shape every exchange reduces to: full
    dumps, hash dumps, difference responses, steady-state floods and
    local subscriber updates are all Publications with different fields
    populated. Parameter structs for the public operations live here
    too, so the wire protocol module stays a thin tagged enum.
*/

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::filters::FilterOperator;
use super::value::Value;

/// Key/value delta envelope flowing between stores and to subscribers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    /// Accepted or dumped records
    pub key_vals: HashMap<String, Value>,

    /// Keys removed locally because their TTL ran out
    pub expired_keys: Vec<String>,

    /// Flood path: node IDs this publication has visited, used to break loops
    pub node_ids: Option<Vec<String>>,

    /// Keys the responder wants back from the requester (three-way sync)
    pub tobe_updated_keys: Option<Vec<String>>,

    /// Spanning-tree root this flood travels on, when flood optimization is active
    pub flood_root_id: Option<String>,

    /// Area this publication belongs to
    pub area: String,
}

impl Publication {
    pub fn new(area: impl Into<String>) -> Self {
        Publication { area: area.into(), ..Default::default() }
    }

    /// Whether there is nothing to deliver
    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty()
            && self.expired_keys.is_empty()
            && self.tobe_updated_keys.as_ref().map_or(true, |k| k.is_empty())
    }

    /// Whether the flood path already contains the given node
    pub fn has_visited(&self, node_id: &str) -> bool {
        self.node_ids
            .as_ref()
            .map_or(false, |ids| ids.iter().any(|id| id == node_id))
    }
}

/// Parameters for a multi-get
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyGetParams {
    pub keys: Vec<String>,
}

/// Parameters for originator writes and merge payloads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeySetParams {
    /// Records to merge
    pub key_vals: HashMap<String, Value>,

    /// Flood path carried along with the payload
    pub node_ids: Option<Vec<String>>,

    /// Spanning-tree root the sender flooded on
    pub flood_root_id: Option<String>,
}

/// Parameters for filtered dumps and hash dumps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyDumpParams {
    /// Key prefixes to match; empty matches all
    pub prefixes: Vec<String>,

    /// Originator IDs to match; empty matches all
    pub originator_ids: BTreeSet<String>,

    /// How prefix and originator predicates combine
    pub operator: FilterOperator,

    /// Return hash-only records instead of payloads
    pub do_not_publish_value: bool,

    /// Requester's hash dump, turning the dump into a difference
    /// response plus tobe-updated keys (three-way sync step one)
    pub key_val_hashes: Option<HashMap<String, Value>>,
}

/// Transport coordinates of one peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    /// Transport-dependent command endpoint
    pub cmd_url: String,

    /// Control-channel port on the peer
    pub ctrl_port: u16,
}

/// Child set/unset command for the dual flood plane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloodTopoSetParams {
    /// Root the action applies to; ignored when `all_roots` is set
    pub root_id: Option<String>,

    /// Node requesting the change (the would-be child)
    pub src_id: String,

    /// True to set the sender as child, false to unset
    pub set_child: bool,

    /// Apply the unset across every root (used on peer teardown)
    pub all_roots: bool,
}

/// Snapshot of one root's spanning tree as this node sees it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SptInfo {
    /// True when the route to this root is settled
    pub passive: bool,

    /// Distance to the root, or [`super::dual::DISTANCE_INFINITY`] if unreachable
    pub cost: i64,

    /// Upstream peer toward the root
    pub parent: Option<String>,

    /// Peers that chose us as their upstream for this root
    pub children: BTreeSet<String>,
}

/// Spanning-tree snapshot across all roots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SptInfos {
    /// Per-root tree state
    pub infos: BTreeMap<String, SptInfo>,

    /// The root this node currently floods on
    pub flood_root_id: Option<String>,
}
