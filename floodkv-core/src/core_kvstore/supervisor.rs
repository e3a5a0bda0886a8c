/*
    supervisor.rs - the store supervisor owning one StoreDb per area

    Responsibilities:
    The KvStore is the only type the rest of the daemon talks to. It
    spawns one task per configured area, routes every public operation
    to the right area's command queue, consumes peer events from the
    link monitor, serves inbound wire requests, and publishes local
    updates and sync events on broadcast channels.

    Every public operation runs under the configured deadline; callers
    see Timeout when an area cannot answer in time and ShuttingDown
    after stop().

    Inputs:
    - public API calls (area-scoped)
    - peer add/del events from the link monitor
    - inbound requests from the peer transport

    Outputs:
    - commands onto area queues
    - the subscriber update stream and sync event stream
    - periodic counter snapshots to the log
*/

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::MetricsCollector;
use crate::shutdown::ShutdownCoordinator;

use super::dual::DualMessages;
use super::errors::{KvStoreError, KvStoreResult};
use super::events::{KvStoreSyncEvent, PeerEvent};
use super::filters::KvFilters;
use super::message::KvStoreReply;
use super::peer::PeerState;
use super::publication::{
    FloodTopoSetParams, KeyDumpParams, KeyGetParams, KeySetParams, PeerSpec, Publication, SptInfos,
};
use super::store_db::{AreaCommand, StoreDb, StoreDbParams};
use super::transport::{InboundRequest, PeerTransport};

/// Cadence of the counter snapshot written to the log
pub const COUNTER_SUBMIT_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity of the subscriber update stream
const UPDATES_CHANNEL_CAPACITY: usize = 1024;

/// Store supervisor: one per daemon
pub struct KvStore {
    node_id: String,
    areas: HashMap<String, mpsc::Sender<AreaCommand>>,
    updates_tx: broadcast::Sender<Publication>,
    sync_events_tx: broadcast::Sender<KvStoreSyncEvent>,
    metrics: Arc<MetricsCollector>,
    shutdown: Arc<ShutdownCoordinator>,
    op_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KvStore {
    /// Build the store, spawn one task per configured area, and start
    /// consuming peer events
    pub fn new(
        config: &Config,
        transport: Arc<dyn PeerTransport>,
        peer_events_rx: mpsc::Receiver<PeerEvent>,
    ) -> KvStoreResult<Self> {
        config
            .validate()
            .map_err(|e| KvStoreError::InvalidArgument(e.to_string()))?;

        let (updates_tx, _) = broadcast::channel(UPDATES_CHANNEL_CAPACITY);
        let (sync_events_tx, _) = broadcast::channel(64);
        let metrics = Arc::new(MetricsCollector::new());
        let shutdown = Arc::new(ShutdownCoordinator::new());

        let mut areas = HashMap::new();
        let mut tasks = Vec::new();

        for area_config in &config.areas {
            let filters = if area_config.key_prefix_filters.is_empty()
                && area_config.originator_id_filters.is_empty()
            {
                None
            } else {
                Some(KvFilters::new(
                    area_config.key_prefix_filters.clone(),
                    area_config.originator_id_filters.clone(),
                ))
            };
            let params = StoreDbParams {
                node_id: config.node_id.clone(),
                key_ttl: config.key_ttl,
                sync_interval: config.sync_interval,
                ttl_decrement: config.ttl_decrement,
                flood_rate: config.flood_rate,
                filters,
                enable_flood_optimization: config.enable_flood_optimization,
                is_flood_root: config.is_flood_root,
            };

            let (cmd_tx, cmd_rx) = mpsc::channel(config.queue_capacity);
            let store = StoreDb::new(
                &area_config.area_id,
                params,
                Arc::clone(&transport),
                updates_tx.clone(),
                sync_events_tx.clone(),
                Arc::clone(&metrics),
                cmd_tx.clone(),
            );
            tasks.push(tokio::spawn(store.run(cmd_rx, shutdown.subscribe())));
            areas.insert(area_config.area_id.clone(), cmd_tx);
        }

        info!(node = %config.node_id, areas = areas.len(), "kv store supervisor started");

        let kvstore = KvStore {
            node_id: config.node_id.clone(),
            areas,
            updates_tx,
            sync_events_tx,
            metrics,
            shutdown,
            op_timeout: config.op_timeout,
            tasks: Mutex::new(tasks),
        };
        kvstore.spawn_peer_event_consumer(peer_events_rx);
        kvstore.spawn_counter_task();
        Ok(kvstore)
    }

    /// Serve inbound wire requests from the given queue, routing each to
    /// its target area
    pub fn serve_inbound(&self, mut inbound_rx: mpsc::Receiver<InboundRequest>) {
        let areas = self.areas.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_inbound = inbound_rx.recv() => {
                        let Some(inbound) = maybe_inbound else { break };
                        let InboundRequest { request, reply_tx } = inbound;
                        match areas.get(&request.area) {
                            Some(cmd_tx) => {
                                let forwarded = cmd_tx
                                    .send(AreaCommand::Inbound { request, reply_tx })
                                    .await;
                                if forwarded.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = reply_tx.send(KvStoreReply::Error(format!(
                                    "unknown area {}",
                                    request.area
                                )));
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        self.tasks.lock().expect("task list lock poisoned").push(task);
    }

    fn spawn_peer_event_consumer(&self, mut peer_events_rx: mpsc::Receiver<PeerEvent>) {
        let areas = self.areas.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_event = peer_events_rx.recv() => {
                        let Some(event) = maybe_event else { break };
                        let Some(cmd_tx) = areas.get(&event.area) else {
                            warn!(area = %event.area, "peer event for unknown area dropped");
                            continue;
                        };
                        if !event.peers_to_add.is_empty() {
                            let (reply, _) = oneshot::channel();
                            let _ = cmd_tx
                                .send(AreaCommand::AddUpdatePeers {
                                    peers: event.peers_to_add,
                                    reply,
                                })
                                .await;
                        }
                        if !event.peers_to_del.is_empty() {
                            let (reply, _) = oneshot::channel();
                            let _ = cmd_tx
                                .send(AreaCommand::DelPeers { peers: event.peers_to_del, reply })
                                .await;
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        self.tasks.lock().expect("task list lock poisoned").push(task);
    }

    fn spawn_counter_task(&self) {
        let metrics = Arc::clone(&self.metrics);
        let node_id = self.node_id.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(COUNTER_SUBMIT_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let snapshot = metrics.snapshot();
                        debug!(
                            node = %node_id,
                            publications_received = snapshot.publications_received,
                            publications_sent = snapshot.publications_sent,
                            keys_merged = snapshot.keys_merged,
                            merge_drops = snapshot.merge_drops,
                            keys_expired = snapshot.keys_expired,
                            full_sync_successes = snapshot.full_sync_successes,
                            full_sync_failures = snapshot.full_sync_failures,
                            avg_sync_ms = ?snapshot.avg_sync_duration_ms(),
                            "store counters"
                        );
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        self.tasks.lock().expect("task list lock poisoned").push(task);
    }

    /// Route one command to an area and await its reply under the deadline
    async fn area_request<T>(
        &self,
        area: &str,
        make: impl FnOnce(oneshot::Sender<KvStoreResult<T>>) -> AreaCommand,
    ) -> KvStoreResult<T> {
        if self.shutdown.is_shutting_down() {
            return Err(KvStoreError::ShuttingDown);
        }
        let cmd_tx = self
            .areas
            .get(area)
            .ok_or_else(|| KvStoreError::NotFound(format!("area {area}")))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| KvStoreError::ShuttingDown)?;

        match tokio::time::timeout(self.op_timeout, reply_rx).await {
            Err(_) => Err(KvStoreError::Timeout(format!("area {area} did not answer"))),
            Ok(Err(_)) => Err(KvStoreError::ShuttingDown),
            Ok(Ok(result)) => result,
        }
    }

    //
    // Public, area-scoped API
    //

    /// Multi-get; missing keys are absent from the result
    pub async fn get_kv_store_key_vals(
        &self,
        area: &str,
        params: KeyGetParams,
    ) -> KvStoreResult<Publication> {
        self.area_request(area, |reply| AreaCommand::GetKeyVals { params, reply }).await
    }

    /// Originator writes: merge locally and flood the delta
    pub async fn set_kv_store_key_vals(
        &self,
        area: &str,
        params: KeySetParams,
    ) -> KvStoreResult<()> {
        self.area_request(area, |reply| AreaCommand::SetKeyVals { params, reply }).await
    }

    /// Filtered dump of selected areas (all configured areas when empty)
    pub async fn dump_kv_store_keys(
        &self,
        params: KeyDumpParams,
        select_areas: BTreeSet<String>,
    ) -> KvStoreResult<Vec<Publication>> {
        let targets: Vec<String> = if select_areas.is_empty() {
            self.areas.keys().cloned().collect()
        } else {
            for area in &select_areas {
                if !self.areas.contains_key(area) {
                    return Err(KvStoreError::NotFound(format!("area {area}")));
                }
            }
            select_areas.into_iter().collect()
        };

        let mut publications = Vec::with_capacity(targets.len());
        for area in targets {
            let params = params.clone();
            let publication = self
                .area_request(&area, |reply| AreaCommand::DumpAll { params, reply })
                .await?;
            publications.push(publication);
        }
        Ok(publications)
    }

    /// Filtered hash-only dump of one area
    pub async fn dump_kv_store_hashes(
        &self,
        area: &str,
        params: KeyDumpParams,
    ) -> KvStoreResult<Publication> {
        self.area_request(area, |reply| AreaCommand::DumpHashes { params, reply }).await
    }

    /// Current peers of one area
    pub async fn get_kv_store_peers(
        &self,
        area: &str,
    ) -> KvStoreResult<HashMap<String, PeerSpec>> {
        self.area_request(area, |reply| AreaCommand::DumpPeers { reply }).await
    }

    /// Add or update peers in one area
    pub async fn add_update_kv_store_peers(
        &self,
        area: &str,
        peers: HashMap<String, PeerSpec>,
    ) -> KvStoreResult<()> {
        self.area_request(area, |reply| AreaCommand::AddUpdatePeers { peers, reply }).await
    }

    /// Remove peers from one area
    pub async fn delete_kv_store_peers(
        &self,
        area: &str,
        peers: Vec<String>,
    ) -> KvStoreResult<()> {
        self.area_request(area, |reply| AreaCommand::DelPeers { peers, reply }).await
    }

    /// Spanning-tree snapshot of one area
    pub async fn get_spanning_tree_infos(&self, area: &str) -> KvStoreResult<SptInfos> {
        self.area_request(area, |reply| AreaCommand::GetSptInfos { reply }).await
    }

    /// Child set/unset on the dual flood plane
    pub async fn update_flood_topology_child(
        &self,
        area: &str,
        params: FloodTopoSetParams,
    ) -> KvStoreResult<()> {
        self.area_request(area, |reply| AreaCommand::FloodTopoSet { params, reply }).await
    }

    /// Inject dual protocol messages on behalf of a neighbor
    pub async fn process_kv_store_dual_message(
        &self,
        area: &str,
        sender_id: String,
        msgs: DualMessages,
    ) -> KvStoreResult<()> {
        self.area_request(area, |reply| AreaCommand::ProcessDualMessages {
            sender_id,
            msgs,
            reply,
        })
        .await
    }

    /// Sync state of one peer; None when the peer is unknown
    pub async fn get_kv_store_peer_state(
        &self,
        area: &str,
        peer: &str,
    ) -> KvStoreResult<Option<PeerState>> {
        let peer = peer.to_string();
        self.area_request(area, |reply| AreaCommand::GetPeerState { peer, reply }).await
    }

    /// Aggregate counters: per-area gauges plus the global snapshot
    pub async fn get_counters(&self) -> KvStoreResult<HashMap<String, i64>> {
        let mut counters = HashMap::new();
        let areas: Vec<String> = self.areas.keys().cloned().collect();
        for area in areas {
            let area_counters = self
                .area_request(&area, |reply| AreaCommand::GetCounters { reply })
                .await?;
            for (name, value) in area_counters {
                counters.insert(format!("{name}.{area}"), value);
            }
        }

        let snapshot = self.metrics.snapshot();
        counters.insert(
            "kvstore.publications_received".to_string(),
            snapshot.publications_received as i64,
        );
        counters
            .insert("kvstore.publications_sent".to_string(), snapshot.publications_sent as i64);
        counters.insert("kvstore.keys_merged".to_string(), snapshot.keys_merged as i64);
        counters.insert("kvstore.merge_drops".to_string(), snapshot.merge_drops as i64);
        counters.insert("kvstore.keys_expired".to_string(), snapshot.keys_expired as i64);
        counters.insert(
            "kvstore.full_sync_successes".to_string(),
            snapshot.full_sync_successes as i64,
        );
        counters
            .insert("kvstore.full_sync_failures".to_string(), snapshot.full_sync_failures as i64);
        counters
            .insert("kvstore.transport_failures".to_string(), snapshot.transport_failures as i64);
        Ok(counters)
    }

    /// Subscribe to the per-key update stream (merges and expirations)
    pub fn update_reader(&self) -> broadcast::Receiver<Publication> {
        self.updates_tx.subscribe()
    }

    /// Subscribe to peer initial-sync completions
    pub fn sync_events_reader(&self) -> broadcast::Receiver<KvStoreSyncEvent> {
        self.sync_events_tx.subscribe()
    }

    /// Shared counters handle
    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// Name of this node
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Configured areas
    pub fn area_ids(&self) -> Vec<String> {
        self.areas.keys().cloned().collect()
    }

    /// Signal shutdown and wait for every task to drain
    pub async fn stop(&self) {
        self.shutdown.shutdown();
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("task list lock poisoned"));
        for task in tasks {
            let _ = task.await;
        }
        info!(node = %self.node_id, "kv store supervisor stopped");
    }
}
