/*
    store_db.rs - one area's replicated store and its event loop

    Responsibilities:
    A StoreDb owns everything scoped to one area: the key->value map,
    the peer table with per-peer sync state, the TTL countdown queue,
    the flood rate limiter with its pending buffer, and (when flood
    optimization is on) the dual spanning-tree state.

    All mutable state is owned by a single task. The public API and the
    wire protocol enqueue commands; timers are select! branches of the
    same loop. Outbound requests run on spawned tasks and report back
    through the command queue, so the loop never blocks on a peer.

    Inputs:
    - area commands from the supervisor (API calls, inbound requests)
    - timer ticks: TTL sweep, sync scan, periodic resync, flood flush,
      keep-alive, root re-assertion
    - completions of outbound sync requests and flood sends

    Outputs:
    - publications to local subscribers (updates and expirations)
    - floods, sync requests, and dual messages to peers
    - sync events and counters
*/

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;
use crate::shutdown::ShutdownSignal;

use super::dual::{DualAction, DualMessages, DualState};
use super::errors::{KvStoreError, KvStoreResult};
use super::events::KvStoreSyncEvent;
use super::filters::KvFilters;
use super::merge::merge_key_values;
use super::message::{KvStoreCommand, KvStoreReply, KvStoreRequest};
use super::peer::{
    KvStorePeer, PeerState, PeerSyncEvent, PARALLEL_SYNC_LIMIT_INITIAL, PARALLEL_SYNC_LIMIT_MAX,
};
use super::publication::{
    FloodTopoSetParams, KeyDumpParams, KeyGetParams, KeySetParams, PeerSpec, Publication, SptInfos,
};
use super::rate_limiter::{FloodLimiter, FloodRate};
use super::transport::PeerTransport;
use super::ttl_queue::TtlCountdownQueue;
use super::value::{compare_values, Value, ValueOrdering, TTL_THRESHOLD_MS};

/// Cadence of the scan promoting idle peers into their initial sync
pub const SYNC_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of the flush draining rate-limited publications
pub const FLOOD_PENDING_INTERVAL: Duration = Duration::from_millis(100);

/// Cadence of the keep-alive ping toward synced peers
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Cadence at which declared roots re-assert their trees
pub const ROOT_REASSERT_INTERVAL: Duration = Duration::from_secs(60);

/// Idle arm for the TTL timer when nothing is queued
const TTL_TIMER_IDLE: Duration = Duration::from_secs(3600);

/// Parameters shared by every StoreDb instance of one node
#[derive(Clone)]
pub struct StoreDbParams {
    pub node_id: String,
    pub key_ttl: Duration,
    pub sync_interval: Duration,
    pub ttl_decrement: Duration,
    pub flood_rate: Option<FloodRate>,
    pub filters: Option<KvFilters>,
    pub enable_flood_optimization: bool,
    pub is_flood_root: bool,
}

/// Commands executed on the area task. Public operations carry a reply
/// channel; the internal variants are completions of outbound work.
pub(crate) enum AreaCommand {
    GetKeyVals {
        params: KeyGetParams,
        reply: oneshot::Sender<KvStoreResult<Publication>>,
    },
    DumpAll {
        params: KeyDumpParams,
        reply: oneshot::Sender<KvStoreResult<Publication>>,
    },
    DumpHashes {
        params: KeyDumpParams,
        reply: oneshot::Sender<KvStoreResult<Publication>>,
    },
    SetKeyVals {
        params: KeySetParams,
        reply: oneshot::Sender<KvStoreResult<()>>,
    },
    DumpPeers {
        reply: oneshot::Sender<KvStoreResult<HashMap<String, PeerSpec>>>,
    },
    AddUpdatePeers {
        peers: HashMap<String, PeerSpec>,
        reply: oneshot::Sender<KvStoreResult<()>>,
    },
    DelPeers {
        peers: Vec<String>,
        reply: oneshot::Sender<KvStoreResult<()>>,
    },
    GetSptInfos {
        reply: oneshot::Sender<KvStoreResult<SptInfos>>,
    },
    FloodTopoSet {
        params: FloodTopoSetParams,
        reply: oneshot::Sender<KvStoreResult<()>>,
    },
    ProcessDualMessages {
        sender_id: String,
        msgs: DualMessages,
        reply: oneshot::Sender<KvStoreResult<()>>,
    },
    GetCounters {
        reply: oneshot::Sender<KvStoreResult<HashMap<String, i64>>>,
    },
    GetPeerState {
        peer: String,
        reply: oneshot::Sender<KvStoreResult<Option<PeerState>>>,
    },
    /// A request arriving over the peer transport
    Inbound {
        request: KvStoreRequest,
        reply_tx: oneshot::Sender<KvStoreReply>,
    },
    /// Completion of an outbound full-sync request
    SyncResponse {
        peer: String,
        result: Result<Publication, String>,
        duration: Duration,
    },
    /// A fire-and-forget send toward a peer failed
    PeerFailure {
        peer: String,
        error: String,
    },
}

/// One area's store
pub struct StoreDb {
    area: String,
    params: StoreDbParams,
    key_vals: HashMap<String, Value>,
    peers: HashMap<String, KvStorePeer>,
    ttl_queue: TtlCountdownQueue,
    flood_limiter: Option<FloodLimiter>,
    /// Keys awaiting flood once the limiter refills, bucketed by flood root
    pending_flood_keys: HashMap<Option<String>, HashSet<String>>,
    dual: Option<DualState>,
    parallel_sync_limit: usize,
    transport: Arc<dyn PeerTransport>,
    updates_tx: broadcast::Sender<Publication>,
    sync_events_tx: broadcast::Sender<KvStoreSyncEvent>,
    metrics: Arc<MetricsCollector>,
    /// Handle back into our own command queue, for spawned completions
    self_tx: mpsc::Sender<AreaCommand>,
}

impl StoreDb {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        area: impl Into<String>,
        params: StoreDbParams,
        transport: Arc<dyn PeerTransport>,
        updates_tx: broadcast::Sender<Publication>,
        sync_events_tx: broadcast::Sender<KvStoreSyncEvent>,
        metrics: Arc<MetricsCollector>,
        self_tx: mpsc::Sender<AreaCommand>,
    ) -> Self {
        let area = area.into();
        let flood_limiter = params.flood_rate.map(FloodLimiter::new);
        let dual = params
            .enable_flood_optimization
            .then(|| DualState::new(params.node_id.clone(), params.is_flood_root));
        StoreDb {
            area,
            params,
            key_vals: HashMap::new(),
            peers: HashMap::new(),
            ttl_queue: TtlCountdownQueue::new(),
            flood_limiter,
            pending_flood_keys: HashMap::new(),
            dual,
            parallel_sync_limit: PARALLEL_SYNC_LIMIT_INITIAL,
            transport,
            updates_tx,
            sync_events_tx,
            metrics,
            self_tx,
        }
    }

    /// Area event loop. Owns the store until shutdown or queue closure.
    pub(crate) async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<AreaCommand>,
        mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
    ) {
        info!(area = %self.area, node = %self.params.node_id, "area store started");

        let mut sync_scan = tokio::time::interval(SYNC_SCAN_INTERVAL);
        let mut periodic_resync = tokio::time::interval(self.params.sync_interval);
        let mut flood_flush = tokio::time::interval(FLOOD_PENDING_INTERVAL);
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        let mut root_check = tokio::time::interval(ROOT_REASSERT_INTERVAL);
        for interval in [
            &mut sync_scan,
            &mut periodic_resync,
            &mut flood_flush,
            &mut keep_alive,
            &mut root_check,
        ] {
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the immediate first tick is a no-op on an empty store
        }

        loop {
            let ttl_deadline = self
                .ttl_queue
                .earliest_expiry()
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + TTL_TIMER_IDLE);

            tokio::select! {
                maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = tokio::time::sleep_until(ttl_deadline) => self.cleanup_ttl_countdown_queue(),
                _ = sync_scan.tick() => self.request_full_sync_from_peers(),
                _ = periodic_resync.tick() => self.periodic_resync(),
                _ = flood_flush.tick() => self.flood_buffered_updates(),
                _ = keep_alive.tick() => self.send_keep_alives(),
                _ = root_check.tick() => self.reassert_flood_root(),
                _ = shutdown_rx.recv() => break,
            }
        }

        info!(area = %self.area, "area store stopping");
        self.peers.clear();
        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            reject_command(cmd);
        }
    }

    fn handle_command(&mut self, cmd: AreaCommand) {
        match cmd {
            AreaCommand::GetKeyVals { params, reply } => {
                let _ = reply.send(self.get_key_vals(&params.keys));
            }
            AreaCommand::DumpAll { params, reply } => {
                let _ = reply.send(Ok(self.dump_all_with_filters(&params)));
            }
            AreaCommand::DumpHashes { params, reply } => {
                let _ = reply.send(Ok(self.dump_hash_with_filters(&params)));
            }
            AreaCommand::SetKeyVals { params, reply } => {
                let _ = reply.send(self.set_key_vals(params));
            }
            AreaCommand::DumpPeers { reply } => {
                let peers = self
                    .peers
                    .iter()
                    .map(|(name, peer)| (name.clone(), peer.spec.clone()))
                    .collect();
                let _ = reply.send(Ok(peers));
            }
            AreaCommand::AddUpdatePeers { peers, reply } => {
                let _ = reply.send(self.add_update_peers(peers));
            }
            AreaCommand::DelPeers { peers, reply } => {
                let _ = reply.send(self.del_peers(&peers));
            }
            AreaCommand::GetSptInfos { reply } => {
                let result = match &self.dual {
                    Some(dual) => Ok(dual.spt_infos()),
                    None => Ok(SptInfos::default()),
                };
                let _ = reply.send(result);
            }
            AreaCommand::FloodTopoSet { params, reply } => {
                let _ = reply.send(self.process_flood_topo_set(&params));
            }
            AreaCommand::ProcessDualMessages { sender_id, msgs, reply } => {
                let _ = reply.send(self.process_dual_messages(&sender_id, &msgs));
            }
            AreaCommand::GetCounters { reply } => {
                let _ = reply.send(Ok(self.counters()));
            }
            AreaCommand::GetPeerState { peer, reply } => {
                let _ = reply.send(Ok(self.peers.get(&peer).map(|p| p.state)));
            }
            AreaCommand::Inbound { request, reply_tx } => {
                self.handle_inbound(request, reply_tx);
            }
            AreaCommand::SyncResponse { peer, result, duration } => {
                self.handle_sync_response(&peer, result, duration);
            }
            AreaCommand::PeerFailure { peer, error } => {
                self.handle_peer_failure(&peer, &error);
            }
        }
    }

    //
    // Reads
    //

    /// Multi-get; missing keys are simply absent from the result
    fn get_key_vals(&self, keys: &[String]) -> KvStoreResult<Publication> {
        if keys.iter().any(|k| k.is_empty()) {
            return Err(KvStoreError::InvalidArgument("empty key".to_string()));
        }
        let mut publication = Publication::new(&self.area);
        for key in keys {
            if let Some(value) = self.key_vals.get(key) {
                publication.key_vals.insert(key.clone(), value.clone());
            }
        }
        self.update_publication_ttl(&mut publication, false);
        Ok(publication)
    }

    /// Filtered scan of the whole store
    fn dump_all_with_filters(&self, params: &KeyDumpParams) -> Publication {
        let filters = KvFilters::new(params.prefixes.clone(), params.originator_ids.clone());
        let mut publication = Publication::new(&self.area);
        for (key, value) in &self.key_vals {
            if !filters.key_match(key, value, params.operator) {
                continue;
            }
            let out = if params.do_not_publish_value { value.as_hash_only() } else { value.clone() };
            publication.key_vals.insert(key.clone(), out);
        }
        self.update_publication_ttl(&mut publication, true);
        publication
    }

    /// Filtered scan returning hashes only (sync step one)
    fn dump_hash_with_filters(&self, params: &KeyDumpParams) -> Publication {
        let filters = KvFilters::new(params.prefixes.clone(), params.originator_ids.clone());
        let mut publication = Publication::new(&self.area);
        for (key, value) in &self.key_vals {
            if !filters.key_match(key, value, params.operator) {
                continue;
            }
            publication.key_vals.insert(key.clone(), value.as_hash_only());
        }
        publication
    }

    /// Difference response for a requester's hash dump: full records the
    /// requester is missing or holds stale, plus the keys it should send
    /// back because its copies are newer or undecidable
    fn dump_difference(&self, req_key_vals: &HashMap<String, Value>) -> Publication {
        let mut publication = Publication::new(&self.area);

        for (key, mine) in &self.key_vals {
            match req_key_vals.get(key) {
                None => {
                    publication.key_vals.insert(key.clone(), mine.clone());
                }
                Some(theirs) => match compare_values(mine, theirs) {
                    ValueOrdering::First | ValueOrdering::Unknown => {
                        publication.key_vals.insert(key.clone(), mine.clone());
                    }
                    ValueOrdering::Second | ValueOrdering::Tied => {}
                },
            }
        }

        let mut tobe_updated: Vec<String> = Vec::new();
        for (key, theirs) in req_key_vals {
            match self.key_vals.get(key) {
                None => tobe_updated.push(key.clone()),
                Some(mine) => match compare_values(mine, theirs) {
                    ValueOrdering::Second | ValueOrdering::Unknown => tobe_updated.push(key.clone()),
                    ValueOrdering::First | ValueOrdering::Tied => {}
                },
            }
        }
        if !tobe_updated.is_empty() {
            tobe_updated.sort();
            publication.tobe_updated_keys = Some(tobe_updated);
        }

        publication
    }

    //
    // Writes and merging
    //

    /// Originator-initiated writes: validate, merge locally, flood the delta
    fn set_key_vals(&mut self, mut params: KeySetParams) -> KvStoreResult<()> {
        if params.key_vals.is_empty() {
            return Err(KvStoreError::InvalidArgument("no key-values given".to_string()));
        }
        for (key, value) in params.key_vals.iter_mut() {
            if key.is_empty() {
                return Err(KvStoreError::InvalidArgument("empty key".to_string()));
            }
            if value.version < 1 {
                return Err(KvStoreError::InvalidArgument(format!(
                    "version {} for key {} (versions start at 1)",
                    value.version, key
                )));
            }
            if value.ttl_ms == 0 {
                // unspecified lifetime takes the configured default
                value.ttl_ms = self.params.key_ttl.as_millis() as i64;
            }
            value.ensure_hash();
        }

        let publication = Publication {
            key_vals: params.key_vals,
            node_ids: params.node_ids,
            flood_root_id: params.flood_root_id,
            area: self.area.clone(),
            ..Default::default()
        };
        self.merge_publication(publication, None);
        Ok(())
    }

    /// Merge a publication into the store, publish and flood the delta.
    /// Returns the number of records applied.
    fn merge_publication(&mut self, rcvd: Publication, sender: Option<&str>) -> usize {
        self.metrics.inc_publications_received();

        if rcvd.has_visited(&self.params.node_id) {
            debug!(area = %self.area, "publication already visited this node; dropping");
            self.metrics.inc_looped_publications();
            return 0;
        }

        let tobe_updated_keys = rcvd.tobe_updated_keys.clone();
        let node_ids = rcvd.node_ids.clone();
        let flood_root_id = rcvd.flood_root_id.clone();

        let (changed, stats) =
            merge_key_values(&mut self.key_vals, rcvd.key_vals, self.params.filters.as_ref());
        self.metrics.add_keys_merged(stats.updated + stats.ttl_refreshed);
        self.metrics.add_merge_drops(stats.dropped());

        let now = Instant::now();
        for (key, value) in &changed {
            // refreshes must re-arm against the live record, not the
            // possibly hash-only refresh message
            if let Some(live) = self.key_vals.get(key) {
                self.ttl_queue.push(key, live, now);
            } else {
                self.ttl_queue.push(key, value, now);
            }
        }

        let applied = changed.len();
        if !changed.is_empty() {
            debug!(area = %self.area, applied, sender = ?sender, "merged publication");

            let mut delta = Publication::new(&self.area);
            delta.key_vals = changed;
            let _ = self.updates_tx.send(delta.clone());

            // peers mid-sync would race this delta against their dump;
            // park the keys and flood them when the sync lands
            for peer in self.peers.values_mut() {
                if peer.state != PeerState::Synced && Some(peer.node_name.as_str()) != sender {
                    peer.pending_init_keys.extend(delta.key_vals.keys().cloned());
                }
            }

            delta.node_ids = node_ids;
            delta.flood_root_id = flood_root_id;
            self.flood_publication(delta, sender, true);
        }

        // three-way sync closing step: the responder asked for these keys
        if let (Some(sender), Some(keys)) = (sender, tobe_updated_keys) {
            if !keys.is_empty() {
                self.finalize_full_sync(&keys, sender);
            }
        }

        applied
    }

    /// Send full records for `keys` back to the sync responder
    fn finalize_full_sync(&mut self, keys: &[String], peer_name: &str) {
        let Some(peer) = self.peers.get(peer_name) else {
            return;
        };
        let mut publication = Publication::new(&self.area);
        for key in keys {
            if let Some(value) = self.key_vals.get(key) {
                publication.key_vals.insert(key.clone(), value.clone());
            }
        }
        self.update_publication_ttl(&mut publication, false);
        if publication.key_vals.is_empty() {
            return;
        }
        debug!(area = %self.area, peer = %peer_name, keys = publication.key_vals.len(),
               "finalizing full sync");
        let params = KeySetParams {
            key_vals: publication.key_vals,
            node_ids: Some(vec![self.params.node_id.clone()]),
            flood_root_id: None,
        };
        self.spawn_fire_and_forget(peer_name, &peer.spec.clone(), KvStoreCommand::KeySet(params));
        self.metrics.inc_publications_sent();
    }

    //
    // Flooding
    //

    /// Flood a publication to the flood-peer set, excluding the sender
    fn flood_publication(&mut self, mut publication: Publication, exclude: Option<&str>, rate_limit: bool) {
        if publication.key_vals.is_empty() {
            return;
        }

        if publication.flood_root_id.is_none() {
            if let Some(dual) = &self.dual {
                publication.flood_root_id = dual.current_flood_root();
            }
        }

        if rate_limit {
            if let Some(limiter) = &mut self.flood_limiter {
                if !limiter.try_acquire() {
                    let keys: HashSet<String> = publication.key_vals.keys().cloned().collect();
                    self.buffer_publication(publication.flood_root_id.clone(), keys);
                    return;
                }
            }
        }

        self.update_publication_ttl(&mut publication, false);
        if publication.key_vals.is_empty() {
            return;
        }

        let mut node_ids = publication.node_ids.take().unwrap_or_default();
        node_ids.push(self.params.node_id.clone());
        publication.node_ids = Some(node_ids);

        let flood_peers: Vec<String> = match &self.dual {
            Some(dual) => dual
                .flood_peers(&publication.flood_root_id)
                .into_iter()
                .filter(|name| self.peers.contains_key(name))
                .collect(),
            None => self.peers.keys().cloned().collect(),
        };

        let params = KeySetParams {
            key_vals: publication.key_vals,
            node_ids: publication.node_ids,
            flood_root_id: publication.flood_root_id,
        };

        for name in flood_peers {
            if Some(name.as_str()) == exclude {
                continue;
            }
            let Some(peer) = self.peers.get(&name) else {
                continue;
            };
            if peer.state != PeerState::Synced {
                continue;
            }
            self.spawn_fire_and_forget(&name, &peer.spec.clone(), KvStoreCommand::KeySet(params.clone()));
            self.metrics.inc_publications_sent();
        }
    }

    /// Park keys blocked by the limiter, bucketed by flood root
    fn buffer_publication(&mut self, flood_root_id: Option<String>, keys: HashSet<String>) {
        debug!(area = %self.area, keys = keys.len(), "flood rate limited; buffering");
        self.metrics.inc_floods_buffered();
        self.pending_flood_keys.entry(flood_root_id).or_default().extend(keys);
    }

    /// Drain the pending buffer; still-throttled floods re-buffer
    fn flood_buffered_updates(&mut self) {
        if self.pending_flood_keys.is_empty() {
            return;
        }
        let buckets: Vec<(Option<String>, HashSet<String>)> =
            self.pending_flood_keys.drain().collect();
        for (flood_root_id, keys) in buckets {
            let mut publication = Publication::new(&self.area);
            for key in keys {
                // only the latest record matters; dropped keys are gone
                if let Some(value) = self.key_vals.get(&key) {
                    publication.key_vals.insert(key, value.clone());
                }
            }
            if publication.key_vals.is_empty() {
                continue;
            }
            publication.flood_root_id = flood_root_id;
            self.flood_publication(publication, None, true);
        }
    }

    /// Rewrite outgoing TTLs from the countdown queue, applying the
    /// per-hop decrement; drops dead and (optionally) about-to-expire keys
    fn update_publication_ttl(&self, publication: &mut Publication, remove_about_to_expire: bool) {
        let now = Instant::now();
        let decrement = self.params.ttl_decrement.as_millis() as i64;
        publication.key_vals.retain(|key, value| {
            if value.is_immortal() {
                return true;
            }
            let remaining = match self.ttl_queue.remaining_ttl(key, value, now) {
                Some(remaining) => remaining.as_millis() as i64,
                // not tracked here (e.g. relayed before first merge): trust the carried ttl
                None => value.ttl_ms,
            };
            let new_ttl = remaining - decrement;
            if new_ttl <= 0 {
                return false;
            }
            if remove_about_to_expire && new_ttl < TTL_THRESHOLD_MS {
                return false;
            }
            value.ttl_ms = new_ttl;
            true
        });
    }

    //
    // TTL expiry
    //

    /// Pop due countdown entries, drop the keys they still describe, and
    /// publish one deletion publication for the sweep
    fn cleanup_ttl_countdown_queue(&mut self) {
        let now = Instant::now();
        let mut expired_keys = Vec::new();

        for entry in self.ttl_queue.pop_expired(now) {
            match self.key_vals.get(&entry.key) {
                // a newer record or refresh superseded this entry
                Some(live) if !entry.matches(live) => continue,
                None => continue,
                Some(_) => {
                    self.key_vals.remove(&entry.key);
                    expired_keys.push(entry.key);
                }
            }
        }

        if expired_keys.is_empty() {
            return;
        }
        info!(area = %self.area, expired = expired_keys.len(), "expired keys removed");
        self.metrics.add_keys_expired(expired_keys.len() as u64);

        // expirations are local: announced to subscribers, never re-flooded
        let mut publication = Publication::new(&self.area);
        publication.expired_keys = expired_keys;
        let _ = self.updates_tx.send(publication);
    }

    //
    // Peer management and sync
    //

    fn add_update_peers(&mut self, peers: HashMap<String, PeerSpec>) -> KvStoreResult<()> {
        for (name, spec) in peers {
            if name.is_empty() || spec.cmd_url.is_empty() {
                return Err(KvStoreError::InvalidArgument(
                    "peer name and cmd_url must be non-empty".to_string(),
                ));
            }
            if name == self.params.node_id {
                warn!(area = %self.area, "ignoring attempt to peer with ourselves");
                continue;
            }
            match self.peers.get_mut(&name) {
                Some(peer) => {
                    // endpoint changes invalidate any sync in flight
                    peer.spec = spec;
                    peer.transition(PeerSyncEvent::PeerAdd, &self.area);
                    peer.sync_started_at = None;
                }
                None => {
                    info!(area = %self.area, peer = %name, "peer added");
                    self.peers.insert(name.clone(), KvStorePeer::new(name.clone(), spec));
                }
            }
            if let Some(dual) = &mut self.dual {
                let actions = dual.peer_up(&name);
                self.execute_dual_actions(actions);
            }
        }
        Ok(())
    }

    fn del_peers(&mut self, names: &[String]) -> KvStoreResult<()> {
        for name in names {
            if self.peers.remove(name).is_some() {
                info!(area = %self.area, peer = %name, "peer removed");
            }
            if let Some(dual) = &mut self.dual {
                let actions = dual.peer_down(name);
                self.execute_dual_actions(actions);
            }
        }
        Ok(())
    }

    /// Promote idle peers whose backoff allows, up to the parallel limit
    fn request_full_sync_from_peers(&mut self) {
        let in_flight =
            self.peers.values().filter(|p| p.state == PeerState::Initialized).count();
        if in_flight >= self.parallel_sync_limit {
            return;
        }
        let mut budget = self.parallel_sync_limit - in_flight;

        let candidates: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Idle && p.backoff.can_try_now())
            .map(|p| p.node_name.clone())
            .collect();

        for name in candidates {
            if budget == 0 {
                break;
            }
            budget -= 1;
            self.start_peer_sync(&name);
        }
    }

    fn start_peer_sync(&mut self, name: &str) {
        let hashes = {
            let filters = self.params.filters.clone().unwrap_or_default();
            let params = KeyDumpParams {
                prefixes: filters.key_prefixes().to_vec(),
                originator_ids: filters.originator_ids().clone(),
                ..Default::default()
            };
            self.dump_hash_with_filters(&params).key_vals
        };

        let Some(peer) = self.peers.get_mut(name) else {
            return;
        };
        info!(area = %self.area, peer = %name, keys = hashes.len(), "requesting full sync");
        peer.state = PeerState::Initialized;
        peer.sync_started_at = Some(Instant::now());

        let filters = self.params.filters.clone().unwrap_or_default();
        let dump_params = KeyDumpParams {
            prefixes: filters.key_prefixes().to_vec(),
            originator_ids: filters.originator_ids().clone(),
            key_val_hashes: Some(hashes),
            ..Default::default()
        };

        let request = KvStoreRequest::new(
            &self.area,
            &self.params.node_id,
            KvStoreCommand::KeyDump(dump_params),
        );
        let transport = Arc::clone(&self.transport);
        let spec = peer.spec.clone();
        let self_tx = self.self_tx.clone();
        let peer_name = name.to_string();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = match transport.request(&spec, request).await {
                Ok(KvStoreReply::Publication(publication)) => Ok(publication),
                Ok(KvStoreReply::Ack) => Err("unexpected ack to sync request".to_string()),
                Ok(KvStoreReply::Error(e)) => Err(e),
                Err(e) => Err(e.to_string()),
            };
            let _ = self_tx
                .send(AreaCommand::SyncResponse {
                    peer: peer_name,
                    result,
                    duration: started.elapsed(),
                })
                .await;
        });
    }

    fn handle_sync_response(
        &mut self,
        name: &str,
        result: Result<Publication, String>,
        duration: Duration,
    ) {
        if !self.peers.contains_key(name) {
            debug!(area = %self.area, peer = %name, "sync response for unknown peer dropped");
            return;
        }

        match result {
            Ok(publication) => {
                self.merge_publication(publication, Some(name));

                let pending: Vec<String> = {
                    let peer = self.peers.get_mut(name).expect("peer checked above");
                    peer.transition(PeerSyncEvent::SyncRespRcvd, &self.area);
                    peer.backoff.report_success();
                    peer.sync_started_at = None;
                    peer.pending_init_keys.drain().collect()
                };

                self.parallel_sync_limit =
                    (self.parallel_sync_limit * 2).min(PARALLEL_SYNC_LIMIT_MAX);
                self.metrics.inc_full_sync_success();
                self.metrics.observe_sync_duration_ms(duration.as_millis() as u64);
                info!(area = %self.area, peer = %name, ?duration, "initial full sync complete");

                let _ = self.sync_events_tx.send(KvStoreSyncEvent {
                    node_name: name.to_string(),
                    area: self.area.clone(),
                    duration,
                });

                if !pending.is_empty() {
                    self.flood_pending_init_keys(name, pending);
                }
            }
            Err(error) => {
                self.metrics.inc_full_sync_failure();
                self.handle_peer_failure(name, &error);
            }
        }
    }

    /// Keys that changed while the peer was syncing go straight to it
    fn flood_pending_init_keys(&mut self, name: &str, keys: Vec<String>) {
        let Some(peer) = self.peers.get(name) else {
            return;
        };
        let mut publication = Publication::new(&self.area);
        for key in keys {
            if let Some(value) = self.key_vals.get(&key) {
                publication.key_vals.insert(key, value.clone());
            }
        }
        self.update_publication_ttl(&mut publication, false);
        if publication.key_vals.is_empty() {
            return;
        }
        debug!(area = %self.area, peer = %name, keys = publication.key_vals.len(),
               "flooding keys pended during initial sync");
        let params = KeySetParams {
            key_vals: publication.key_vals,
            node_ids: Some(vec![self.params.node_id.clone()]),
            flood_root_id: None,
        };
        self.spawn_fire_and_forget(name, &peer.spec.clone(), KvStoreCommand::KeySet(params));
        self.metrics.inc_publications_sent();
    }

    fn handle_peer_failure(&mut self, name: &str, error: &str) {
        self.metrics.inc_transport_failures();
        let Some(peer) = self.peers.get_mut(name) else {
            return;
        };
        warn!(area = %self.area, peer = %name, error = %error, "peer transport failure");
        peer.transition(PeerSyncEvent::TransportError, &self.area);
        peer.backoff.report_error();
        peer.sync_started_at = None;
    }

    /// Anti-entropy safety net: re-run a full sync against one synced peer
    fn periodic_resync(&mut self) {
        let synced: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Synced)
            .map(|p| p.node_name.clone())
            .collect();
        let Some(name) = synced.choose(&mut rand::thread_rng()) else {
            return;
        };
        debug!(area = %self.area, peer = %name, "periodic resync");
        if let Some(peer) = self.peers.get_mut(name) {
            peer.state = PeerState::Idle;
        }
    }

    /// Lightweight ping holding peer channels open across idle periods
    fn send_keep_alives(&self) {
        for peer in self.peers.values() {
            if peer.state != PeerState::Synced {
                continue;
            }
            self.spawn_fire_and_forget(
                &peer.node_name,
                &peer.spec,
                KvStoreCommand::KeyGet(KeyGetParams::default()),
            );
        }
    }

    //
    // Dual plane
    //

    fn process_flood_topo_set(&mut self, params: &FloodTopoSetParams) -> KvStoreResult<()> {
        match &mut self.dual {
            Some(dual) => {
                dual.process_topo_set(params);
                Ok(())
            }
            None => Err(KvStoreError::InvalidArgument(
                "flood optimization is disabled".to_string(),
            )),
        }
    }

    fn process_dual_messages(&mut self, sender: &str, msgs: &DualMessages) -> KvStoreResult<()> {
        match &mut self.dual {
            Some(dual) => {
                let actions = dual.handle_messages(sender, msgs);
                self.execute_dual_actions(actions);
                Ok(())
            }
            None => Err(KvStoreError::InvalidArgument(
                "flood optimization is disabled".to_string(),
            )),
        }
    }

    fn reassert_flood_root(&mut self) {
        if let Some(dual) = &mut self.dual {
            let actions = dual.reassert_root();
            self.execute_dual_actions(actions);
        }
    }

    fn execute_dual_actions(&self, actions: Vec<DualAction>) {
        for action in actions {
            match action {
                DualAction::Send { peer, messages } => {
                    if let Some(target) = self.peers.get(&peer) {
                        self.spawn_fire_and_forget(
                            &peer,
                            &target.spec,
                            KvStoreCommand::DualMsg(messages),
                        );
                    }
                }
                DualAction::SetChildCmd { peer, params } => {
                    if let Some(target) = self.peers.get(&peer) {
                        self.spawn_fire_and_forget(
                            &peer,
                            &target.spec,
                            KvStoreCommand::FloodTopoSet(params),
                        );
                    }
                }
            }
        }
    }

    //
    // Wire protocol dispatch
    //

    fn handle_inbound(&mut self, request: KvStoreRequest, reply_tx: oneshot::Sender<KvStoreReply>) {
        let sender = request.sender_id;
        let reply = match request.command {
            KvStoreCommand::KeyGet(params) => match self.get_key_vals(&params.keys) {
                Ok(publication) => KvStoreReply::Publication(publication),
                Err(e) => KvStoreReply::Error(e.to_string()),
            },
            KvStoreCommand::KeySet(params) => {
                let publication = Publication {
                    key_vals: params.key_vals,
                    node_ids: params.node_ids,
                    flood_root_id: params.flood_root_id,
                    area: self.area.clone(),
                    ..Default::default()
                };
                self.merge_publication(publication, Some(&sender));
                KvStoreReply::Ack
            }
            KvStoreCommand::KeyDump(params) => match params.key_val_hashes {
                Some(hashes) => {
                    // three-way sync step two: difference plus wanted keys
                    let mut publication = self.dump_difference(&hashes);
                    self.update_publication_ttl(&mut publication, true);
                    KvStoreReply::Publication(publication)
                }
                None => KvStoreReply::Publication(self.dump_all_with_filters(&params)),
            },
            KvStoreCommand::HashDump(params) => {
                KvStoreReply::Publication(self.dump_hash_with_filters(&params))
            }
            KvStoreCommand::DualMsg(msgs) => match self.process_dual_messages(&sender, &msgs) {
                Ok(()) => KvStoreReply::Ack,
                Err(e) => KvStoreReply::Error(e.to_string()),
            },
            KvStoreCommand::FloodTopoSet(params) => match self.process_flood_topo_set(&params) {
                Ok(()) => KvStoreReply::Ack,
                Err(e) => KvStoreReply::Error(e.to_string()),
            },
        };
        let _ = reply_tx.send(reply);
    }

    //
    // Counters
    //

    fn counters(&self) -> HashMap<String, i64> {
        let mut counters = HashMap::new();
        counters.insert("kvstore.num_keys".to_string(), self.key_vals.len() as i64);
        counters.insert("kvstore.num_peers".to_string(), self.peers.len() as i64);
        counters.insert(
            "kvstore.num_synced_peers".to_string(),
            self.peers.values().filter(|p| p.state == PeerState::Synced).count() as i64,
        );
        counters.insert("kvstore.ttl_queue_depth".to_string(), self.ttl_queue.len() as i64);
        counters.insert(
            "kvstore.pending_flood_keys".to_string(),
            self.pending_flood_keys.values().map(|k| k.len()).sum::<usize>() as i64,
        );
        counters
            .insert("kvstore.parallel_sync_limit".to_string(), self.parallel_sync_limit as i64);
        counters
    }

    fn spawn_fire_and_forget(&self, peer_name: &str, spec: &PeerSpec, command: KvStoreCommand) {
        let request = KvStoreRequest::new(&self.area, &self.params.node_id, command);
        let transport = Arc::clone(&self.transport);
        let spec = spec.clone();
        let self_tx = self.self_tx.clone();
        let peer_name = peer_name.to_string();
        tokio::spawn(async move {
            match transport.request(&spec, request).await {
                // an application-level refusal is not a channel problem;
                // demoting the peer for it would loop it through resync
                Ok(KvStoreReply::Error(e)) => {
                    warn!(peer = %peer_name, error = %e, "peer refused request");
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = self_tx
                        .send(AreaCommand::PeerFailure { peer: peer_name, error: e.to_string() })
                        .await;
                }
            }
        });
    }
}

/// Fail a queued command during shutdown drain
pub(crate) fn reject_command(cmd: AreaCommand) {
    match cmd {
        AreaCommand::GetKeyVals { reply, .. } => {
            let _ = reply.send(Err(KvStoreError::ShuttingDown));
        }
        AreaCommand::DumpAll { reply, .. } | AreaCommand::DumpHashes { reply, .. } => {
            let _ = reply.send(Err(KvStoreError::ShuttingDown));
        }
        AreaCommand::SetKeyVals { reply, .. }
        | AreaCommand::AddUpdatePeers { reply, .. }
        | AreaCommand::DelPeers { reply, .. }
        | AreaCommand::FloodTopoSet { reply, .. }
        | AreaCommand::ProcessDualMessages { reply, .. } => {
            let _ = reply.send(Err(KvStoreError::ShuttingDown));
        }
        AreaCommand::DumpPeers { reply } => {
            let _ = reply.send(Err(KvStoreError::ShuttingDown));
        }
        AreaCommand::GetSptInfos { reply } => {
            let _ = reply.send(Err(KvStoreError::ShuttingDown));
        }
        AreaCommand::GetCounters { reply } => {
            let _ = reply.send(Err(KvStoreError::ShuttingDown));
        }
        AreaCommand::GetPeerState { reply, .. } => {
            let _ = reply.send(Err(KvStoreError::ShuttingDown));
        }
        AreaCommand::Inbound { reply_tx, .. } => {
            let _ = reply_tx.send(KvStoreReply::Error("shutting down".to_string()));
        }
        AreaCommand::SyncResponse { .. } | AreaCommand::PeerFailure { .. } => {}
    }
}
