/*
    dual.rs - diffusing-update spanning trees for flood reduction

    Responsibilities:
    One spanning tree is maintained per declared flood root. Each node
    tracks, per root: its parent (successor toward the root), its
    distance, the distances its neighbors last advertised, the set of
    peers that chose it as their parent, and whether the route is
    settled (passive) or being recomputed (active).

    The feasibility condition keeps transient cycles out: a neighbor is
    accepted as successor only while its advertised distance is
    strictly below the local distance. A node that loses its successor
    and has no feasible alternative turns active, diffuses a query to
    every neighbor, and settles again once all replies are in.

    Parent changes are signaled to the affected peers as child
    set/unset commands over the control channel, so each node knows the
    downstream edges of every tree it participates in.

    Inputs:
    - peer up/down from the owning store
    - dual messages (update, query, reply, ack) from neighbors
    - child set/unset commands from downstream peers

    Outputs:
    - dual messages to neighbors
    - child set/unset commands toward old and new parents
    - the flood peer set for a given root, and SPT snapshots
*/

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use super::publication::{FloodTopoSetParams, SptInfo, SptInfos};

/// Unreachable-distance sentinel; headroom left so hop additions cannot wrap
pub const DISTANCE_INFINITY: i64 = i64::MAX / 4;

/// Cost of one flood adjacency
const LINK_METRIC: i64 = 1;

/// One protocol message, tagged by the root it concerns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DualMessage {
    pub root_id: String,
    pub body: DualMessageBody,
}

/// Message bodies of the diffusing-update protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DualMessageBody {
    /// Advertise the sender's distance to the root
    Update { distance: i64, seq: u64 },

    /// The sender lost its route and asks for our distance
    Query { distance: i64 },

    /// Answer to a query
    Reply { distance: i64 },

    /// Acknowledge an update (kept for wire compatibility; counted only)
    Ack,
}

/// Envelope carrying a batch of dual messages between two neighbors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DualMessages {
    pub messages: Vec<DualMessage>,
}

/// Side effects the store must carry out after feeding the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum DualAction {
    /// Send protocol messages to a neighbor
    Send { peer: String, messages: DualMessages },

    /// Ask a peer to set or unset us as its child for a root
    SetChildCmd { peer: String, params: FloodTopoSetParams },
}

/// Route computation status for one root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteStatus {
    Passive,
    Active,
}

/// Per-root state on this node
#[derive(Debug)]
struct RootState {
    parent: Option<String>,
    distance: i64,
    /// Distances neighbors last advertised for this root
    reported: BTreeMap<String, i64>,
    /// Highest update sequence seen per neighbor
    seen_seq: BTreeMap<String, u64>,
    /// Peers that chose us as their parent for this root
    children: BTreeSet<String>,
    status: RouteStatus,
    /// Neighbors we still expect a reply from while active
    pending_replies: BTreeSet<String>,
    /// Sequence of our own outgoing updates
    seq: u64,
}

impl RootState {
    fn new() -> Self {
        RootState {
            parent: None,
            distance: DISTANCE_INFINITY,
            reported: BTreeMap::new(),
            seen_seq: BTreeMap::new(),
            children: BTreeSet::new(),
            status: RouteStatus::Passive,
            pending_replies: BTreeSet::new(),
            seq: 0,
        }
    }

    fn new_self_root() -> Self {
        let mut state = Self::new();
        state.distance = 0;
        state
    }

    /// Best neighbor by advertised distance, name as tie-break
    fn best_neighbor(&self) -> Option<(String, i64)> {
        self.reported
            .iter()
            .filter(|(_, d)| **d < DISTANCE_INFINITY)
            .min_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)))
            .map(|(name, d)| (name.clone(), *d))
    }
}

/// Dual state machine for all roots of one area
#[derive(Debug)]
pub struct DualState {
    node_id: String,
    is_root: bool,
    /// Flood-plane neighbors currently up
    peers: BTreeSet<String>,
    roots: BTreeMap<String, RootState>,
}

impl DualState {
    pub fn new(node_id: impl Into<String>, is_root: bool) -> Self {
        let node_id = node_id.into();
        let mut roots = BTreeMap::new();
        if is_root {
            roots.insert(node_id.clone(), RootState::new_self_root());
        }
        DualState { node_id, is_root, peers: BTreeSet::new(), roots }
    }

    /// A neighbor came up: advertise every root we know to it, and
    /// re-assert the child link if we already route through this peer
    /// (it may have processed our adoption before it knew us)
    pub fn peer_up(&mut self, peer: &str) -> Vec<DualAction> {
        self.peers.insert(peer.to_string());
        let mut actions = Vec::new();

        let mut messages = Vec::new();
        for (root_id, state) in self.roots.iter_mut() {
            state.seq += 1;
            messages.push(DualMessage {
                root_id: root_id.clone(),
                body: DualMessageBody::Update { distance: state.distance, seq: state.seq },
            });
        }
        if !messages.is_empty() {
            actions.push(DualAction::Send {
                peer: peer.to_string(),
                messages: DualMessages { messages },
            });
        }

        for (root_id, state) in &self.roots {
            if state.parent.as_deref() == Some(peer) {
                actions.push(DualAction::SetChildCmd {
                    peer: peer.to_string(),
                    params: FloodTopoSetParams {
                        root_id: Some(root_id.clone()),
                        src_id: self.node_id.clone(),
                        set_child: true,
                        all_roots: false,
                    },
                });
            }
        }

        actions
    }

    /// A neighbor went down: forget its adjacency everywhere and reroute
    pub fn peer_down(&mut self, peer: &str) -> Vec<DualAction> {
        self.peers.remove(peer);
        let mut actions = Vec::new();
        let root_ids: Vec<String> = self.roots.keys().cloned().collect();
        for root_id in root_ids {
            {
                let state = self.roots.get_mut(&root_id).unwrap();
                state.reported.remove(peer);
                state.seen_seq.remove(peer);
                state.children.remove(peer);
                state.pending_replies.remove(peer);
            }
            actions.extend(self.finish_active_if_done(&root_id));
            actions.extend(self.recompute(&root_id));
        }
        actions
    }

    /// Feed a batch of protocol messages from one neighbor
    pub fn handle_messages(&mut self, from: &str, msgs: &DualMessages) -> Vec<DualAction> {
        let mut actions = Vec::new();
        for msg in &msgs.messages {
            actions.extend(self.handle_message(from, msg));
        }
        actions
    }

    fn handle_message(&mut self, from: &str, msg: &DualMessage) -> Vec<DualAction> {
        let root_id = msg.root_id.clone();
        self.ensure_root(&root_id);
        let mut actions = Vec::new();

        match msg.body {
            DualMessageBody::Update { distance, seq } => {
                let state = self.roots.get_mut(&root_id).unwrap();
                let seen = state.seen_seq.get(from).copied().unwrap_or(0);
                if seq < seen {
                    debug!(root = %root_id, peer = %from, seq, seen, "stale dual update ignored");
                    return actions;
                }
                state.seen_seq.insert(from.to_string(), seq);
                state.reported.insert(from.to_string(), distance);
                actions.extend(self.recompute(&root_id));
            }
            DualMessageBody::Query { distance } => {
                let our_distance = {
                    let state = self.roots.get_mut(&root_id).unwrap();
                    state.reported.insert(from.to_string(), distance);
                    state.distance
                };
                actions.push(DualAction::Send {
                    peer: from.to_string(),
                    messages: DualMessages {
                        messages: vec![DualMessage {
                            root_id: root_id.clone(),
                            body: DualMessageBody::Reply { distance: our_distance },
                        }],
                    },
                });
                actions.extend(self.recompute(&root_id));
            }
            DualMessageBody::Reply { distance } => {
                {
                    let state = self.roots.get_mut(&root_id).unwrap();
                    state.reported.insert(from.to_string(), distance);
                    state.pending_replies.remove(from);
                }
                actions.extend(self.finish_active_if_done(&root_id));
            }
            DualMessageBody::Ack => {}
        }

        actions
    }

    /// Child set/unset from a downstream peer
    pub fn process_topo_set(&mut self, params: &FloodTopoSetParams) {
        if params.all_roots {
            for state in self.roots.values_mut() {
                if params.set_child {
                    state.children.insert(params.src_id.clone());
                } else {
                    state.children.remove(&params.src_id);
                }
            }
            return;
        }
        let Some(root_id) = params.root_id.as_ref() else {
            warn!(src = %params.src_id, "flood topo set without root id ignored");
            return;
        };
        self.ensure_root(root_id);
        let state = self.roots.get_mut(root_id).unwrap();
        if params.set_child {
            state.children.insert(params.src_id.clone());
        } else {
            state.children.remove(&params.src_id);
        }
    }

    /// Flood peers for a publication tagged with `root_id`: the tree edges
    /// (parent plus children) for that root. Untagged floods use every peer.
    pub fn flood_peers(&self, root_id: &Option<String>) -> BTreeSet<String> {
        match root_id {
            None => self.peers.clone(),
            Some(root) => match self.roots.get(root) {
                None => self.peers.clone(),
                Some(state) => {
                    let mut peers: BTreeSet<String> =
                        state.children.intersection(&self.peers).cloned().collect();
                    if let Some(parent) = &state.parent {
                        if self.peers.contains(parent) {
                            peers.insert(parent.clone());
                        }
                    }
                    peers
                }
            },
        }
    }

    /// The root this node floods on: the smallest settled, reachable root
    pub fn current_flood_root(&self) -> Option<String> {
        self.roots
            .iter()
            .filter(|(_, s)| s.status == RouteStatus::Passive && s.distance < DISTANCE_INFINITY)
            .map(|(id, _)| id.clone())
            .next()
    }

    /// Periodic self-check for declared roots: re-assert distance zero in
    /// case a competing advertisement ever displaced it
    pub fn reassert_root(&mut self) -> Vec<DualAction> {
        if !self.is_root {
            return Vec::new();
        }
        let node_id = self.node_id.clone();
        let state = self.roots.entry(node_id.clone()).or_insert_with(RootState::new_self_root);
        if state.distance != 0 || state.parent.is_some() {
            warn!(root = %node_id, distance = state.distance, "root lost its own tree; re-asserting");
            state.distance = 0;
            state.parent = None;
            state.status = RouteStatus::Passive;
            state.pending_replies.clear();
        }
        state.seq += 1;
        let seq = state.seq;
        self.broadcast_update(&node_id, 0, seq)
    }

    /// Snapshot for the introspection API
    pub fn spt_infos(&self) -> SptInfos {
        let infos = self
            .roots
            .iter()
            .map(|(root_id, state)| {
                (
                    root_id.clone(),
                    SptInfo {
                        passive: state.status == RouteStatus::Passive,
                        cost: state.distance,
                        parent: state.parent.clone(),
                        children: state.children.clone(),
                    },
                )
            })
            .collect();
        SptInfos { infos, flood_root_id: self.current_flood_root() }
    }

    fn ensure_root(&mut self, root_id: &str) {
        if !self.roots.contains_key(root_id) {
            let state = if root_id == self.node_id && self.is_root {
                RootState::new_self_root()
            } else {
                RootState::new()
            };
            self.roots.insert(root_id.to_string(), state);
        }
    }

    /// Settle the route for one root, or start a diffusing computation.
    ///
    /// Feasibility: only a neighbor advertising strictly less than our
    /// current distance may become successor while passive. A node whose
    /// route worsened past that bound goes active instead.
    fn recompute(&mut self, root_id: &str) -> Vec<DualAction> {
        if root_id == self.node_id && self.is_root {
            return Vec::new();
        }

        let (status, distance, parent, via_parent, best) = {
            let state = self.roots.get(root_id).unwrap();
            let via_parent = state
                .parent
                .as_ref()
                .and_then(|p| state.reported.get(p))
                .map(|d| d + LINK_METRIC);
            let best = state.best_neighbor();
            (state.status, state.distance, state.parent.clone(), via_parent, best)
        };
        if status == RouteStatus::Active {
            return Vec::new();
        }

        match best {
            Some((best_peer, best_reported)) if best_reported < distance => {
                // feasible successor available; adopt the best one
                let new_distance = best_reported + LINK_METRIC;
                {
                    let state = self.roots.get_mut(root_id).unwrap();
                    state.distance = new_distance;
                    state.parent = Some(best_peer.clone());
                }

                let mut actions = Vec::new();
                if parent.as_deref() != Some(best_peer.as_str()) {
                    actions.extend(self.parent_change_cmds(root_id, parent, Some(best_peer)));
                }
                if new_distance != distance {
                    let seq = {
                        let state = self.roots.get_mut(root_id).unwrap();
                        state.seq += 1;
                        state.seq
                    };
                    actions.extend(self.broadcast_update(root_id, new_distance, seq));
                }
                actions
            }
            Some((_, best_reported)) => {
                // route exists only through neighbors at or beyond our
                // distance; check whether our current successor still holds
                match via_parent {
                    Some(d) if d == distance => Vec::new(),
                    _ => self.start_active(root_id, best_reported + LINK_METRIC),
                }
            }
            None => {
                // no reachable neighbor at all
                if distance == DISTANCE_INFINITY && parent.is_none() {
                    return Vec::new();
                }
                let seq = {
                    let state = self.roots.get_mut(root_id).unwrap();
                    state.parent = None;
                    state.distance = DISTANCE_INFINITY;
                    state.seq += 1;
                    state.seq
                };

                let mut actions = self.parent_change_cmds(root_id, parent, None);
                actions.extend(self.broadcast_update(root_id, DISTANCE_INFINITY, seq));
                actions
            }
        }
    }

    /// Begin a diffusing computation: bump our distance to the best known
    /// alternative and query every neighbor
    fn start_active(&mut self, root_id: &str, new_distance: i64) -> Vec<DualAction> {
        let peers = self.peers.clone();
        let state = self.roots.get_mut(root_id).unwrap();
        if peers.is_empty() {
            state.distance = DISTANCE_INFINITY;
            state.parent = None;
            return Vec::new();
        }

        info!(root = %root_id, distance = new_distance, "route lost; starting diffusing computation");
        state.status = RouteStatus::Active;
        state.distance = new_distance;
        state.pending_replies = peers.clone();

        peers
            .into_iter()
            .map(|peer| DualAction::Send {
                peer,
                messages: DualMessages {
                    messages: vec![DualMessage {
                        root_id: root_id.to_string(),
                        body: DualMessageBody::Query { distance: new_distance },
                    }],
                },
            })
            .collect()
    }

    /// Leave the active phase once every reply is in; the feasibility bound
    /// resets, so the best surviving neighbor is adopted unconditionally
    fn finish_active_if_done(&mut self, root_id: &str) -> Vec<DualAction> {
        let (old_parent, new_parent, new_distance, seq) = {
            let state = self.roots.get_mut(root_id).unwrap();
            if state.status != RouteStatus::Active || !state.pending_replies.is_empty() {
                return Vec::new();
            }
            state.status = RouteStatus::Passive;

            let best = state.best_neighbor();
            let old_parent = state.parent.clone();
            let (new_parent, new_distance) = match best {
                Some((peer, reported)) => (Some(peer), reported + LINK_METRIC),
                None => (None, DISTANCE_INFINITY),
            };
            state.parent = new_parent.clone();
            state.distance = new_distance;
            state.seq += 1;
            (old_parent, new_parent, new_distance, state.seq)
        };

        info!(root = %root_id, distance = new_distance, parent = ?new_parent,
              "diffusing computation settled");

        let mut actions = Vec::new();
        if old_parent != new_parent {
            actions.extend(self.parent_change_cmds(root_id, old_parent, new_parent));
        }
        actions.extend(self.broadcast_update(root_id, new_distance, seq));
        actions
    }

    /// Child unset toward the old parent, child set toward the new one
    fn parent_change_cmds(
        &self,
        root_id: &str,
        old_parent: Option<String>,
        new_parent: Option<String>,
    ) -> Vec<DualAction> {
        let mut actions = Vec::new();
        if let Some(old) = old_parent {
            if self.peers.contains(&old) {
                actions.push(DualAction::SetChildCmd {
                    peer: old,
                    params: FloodTopoSetParams {
                        root_id: Some(root_id.to_string()),
                        src_id: self.node_id.clone(),
                        set_child: false,
                        all_roots: false,
                    },
                });
            }
        }
        if let Some(new) = new_parent {
            actions.push(DualAction::SetChildCmd {
                peer: new,
                params: FloodTopoSetParams {
                    root_id: Some(root_id.to_string()),
                    src_id: self.node_id.clone(),
                    set_child: true,
                    all_roots: false,
                },
            });
        }
        actions
    }

    fn broadcast_update(&self, root_id: &str, distance: i64, seq: u64) -> Vec<DualAction> {
        self.peers
            .iter()
            .map(|peer| DualAction::Send {
                peer: peer.clone(),
                messages: DualMessages {
                    messages: vec![DualMessage {
                        root_id: root_id.to_string(),
                        body: DualMessageBody::Update { distance, seq },
                    }],
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deliver actions between nodes until the exchange quiesces
    fn run_to_quiescence(nodes: &mut BTreeMap<String, DualState>, mut actions: Vec<(String, DualAction)>) {
        let mut rounds = 0;
        while !actions.is_empty() {
            rounds += 1;
            assert!(rounds < 100, "dual exchange did not quiesce");
            let mut next = Vec::new();
            for (from, action) in actions.drain(..) {
                match action {
                    DualAction::Send { peer, messages } => {
                        if let Some(node) = nodes.get_mut(&peer) {
                            for a in node.handle_messages(&from, &messages) {
                                next.push((peer.clone(), a));
                            }
                        }
                    }
                    DualAction::SetChildCmd { peer, params } => {
                        if let Some(node) = nodes.get_mut(&peer) {
                            node.process_topo_set(&params);
                        }
                    }
                }
            }
            actions = next;
        }
    }

    /// Bring up a full mesh edge between two nodes and drain the exchange
    fn connect(nodes: &mut BTreeMap<String, DualState>, a: &str, b: &str) {
        let mut actions = Vec::new();
        for x in nodes.get_mut(a).unwrap().peer_up(b) {
            actions.push((a.to_string(), x));
        }
        for x in nodes.get_mut(b).unwrap().peer_up(a) {
            actions.push((b.to_string(), x));
        }
        run_to_quiescence(nodes, actions);
    }

    fn chain_of_three() -> BTreeMap<String, DualState> {
        // r -- a -- b, r is the flood root
        let mut nodes = BTreeMap::new();
        nodes.insert("r".to_string(), DualState::new("r", true));
        nodes.insert("a".to_string(), DualState::new("a", false));
        nodes.insert("b".to_string(), DualState::new("b", false));
        connect(&mut nodes, "r", "a");
        connect(&mut nodes, "a", "b");
        nodes
    }

    #[test]
    fn test_chain_converges_to_tree() {
        let nodes = chain_of_three();

        let a = nodes.get("a").unwrap().spt_infos();
        let info = a.infos.get("r").unwrap();
        assert!(info.passive);
        assert_eq!(info.cost, 1);
        assert_eq!(info.parent.as_deref(), Some("r"));
        assert!(info.children.contains("b"));

        let b = nodes.get("b").unwrap().spt_infos();
        let info = b.infos.get("r").unwrap();
        assert_eq!(info.cost, 2);
        assert_eq!(info.parent.as_deref(), Some("a"));

        let r = nodes.get("r").unwrap().spt_infos();
        let info = r.infos.get("r").unwrap();
        assert_eq!(info.cost, 0);
        assert!(info.parent.is_none());
        assert!(info.children.contains("a"));
    }

    #[test]
    fn test_flood_peers_follow_tree_edges() {
        let nodes = chain_of_three();
        let root = Some("r".to_string());

        // a floods toward both its parent and its child
        let a_peers = nodes.get("a").unwrap().flood_peers(&root);
        assert!(a_peers.contains("r"));
        assert!(a_peers.contains("b"));

        // b only floods to its parent
        let b_peers = nodes.get("b").unwrap().flood_peers(&root);
        assert_eq!(b_peers.len(), 1);
        assert!(b_peers.contains("a"));

        // untagged floods use all physical peers
        let all = nodes.get("a").unwrap().flood_peers(&None);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_triangle_heals_after_parent_loss() {
        // r -- a, r -- b, a -- b: both a and b sit at distance 1
        let mut nodes = BTreeMap::new();
        nodes.insert("r".to_string(), DualState::new("r", true));
        nodes.insert("a".to_string(), DualState::new("a", false));
        nodes.insert("b".to_string(), DualState::new("b", false));
        connect(&mut nodes, "r", "a");
        connect(&mut nodes, "r", "b");
        connect(&mut nodes, "a", "b");

        assert_eq!(nodes.get("a").unwrap().spt_infos().infos.get("r").unwrap().cost, 1);
        assert_eq!(nodes.get("b").unwrap().spt_infos().infos.get("r").unwrap().cost, 1);

        // a loses its direct link to r and must reroute through b
        let mut actions = Vec::new();
        for x in nodes.get_mut("a").unwrap().peer_down("r") {
            actions.push(("a".to_string(), x));
        }
        for x in nodes.get_mut("r").unwrap().peer_down("a") {
            actions.push(("r".to_string(), x));
        }
        run_to_quiescence(&mut nodes, actions);

        let a = nodes.get("a").unwrap().spt_infos();
        let info = a.infos.get("r").unwrap();
        assert!(info.passive);
        assert_eq!(info.parent.as_deref(), Some("b"));
        assert_eq!(info.cost, 2);

        // b keeps its direct route and now carries a as child
        let b = nodes.get("b").unwrap().spt_infos();
        let info = b.infos.get("r").unwrap();
        assert_eq!(info.parent.as_deref(), Some("r"));
        assert!(info.children.contains("a"));
    }

    #[test]
    fn test_current_flood_root_prefers_smallest() {
        let mut nodes = BTreeMap::new();
        nodes.insert("r1".to_string(), DualState::new("r1", true));
        nodes.insert("r2".to_string(), DualState::new("r2", true));
        nodes.insert("x".to_string(), DualState::new("x", false));
        connect(&mut nodes, "r1", "x");
        connect(&mut nodes, "r2", "x");

        assert_eq!(nodes.get("x").unwrap().current_flood_root().as_deref(), Some("r1"));
    }

    #[test]
    fn test_reassert_root_is_stable() {
        let mut root = DualState::new("r", true);
        root.peer_up("a");
        let actions = root.reassert_root();
        // one update per peer, nothing else
        assert_eq!(actions.len(), 1);
        let info = root.spt_infos();
        assert_eq!(info.infos.get("r").unwrap().cost, 0);
    }

    #[test]
    fn test_topo_set_all_roots_unset() {
        let mut node = DualState::new("x", false);
        node.peer_up("c");
        node.process_topo_set(&FloodTopoSetParams {
            root_id: Some("r1".to_string()),
            src_id: "c".to_string(),
            set_child: true,
            all_roots: false,
        });
        node.process_topo_set(&FloodTopoSetParams {
            root_id: Some("r2".to_string()),
            src_id: "c".to_string(),
            set_child: true,
            all_roots: false,
        });
        assert!(node.spt_infos().infos.get("r1").unwrap().children.contains("c"));

        node.process_topo_set(&FloodTopoSetParams {
            root_id: None,
            src_id: "c".to_string(),
            set_child: false,
            all_roots: true,
        });
        assert!(!node.spt_infos().infos.get("r1").unwrap().children.contains("c"));
        assert!(!node.spt_infos().infos.get("r2").unwrap().children.contains("c"));
    }
}
