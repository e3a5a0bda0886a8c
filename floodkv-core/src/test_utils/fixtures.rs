//! Node harness and data builders for tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::core_kvstore::{
    KeySetParams, KvStore, MemoryTransport, PeerEvent, PeerSpec, Value,
};

/// One in-process store node wired to the shared memory transport
pub struct TestNode {
    pub kvstore: KvStore,
    pub peer_events_tx: mpsc::Sender<PeerEvent>,
    pub node_id: String,
    pub cmd_url: String,
}

/// Configuration suitable for tests: one area, long periodic resync so
/// only the initial sync machinery drives the test
pub fn test_config(node_id: &str) -> Config {
    let mut config = Config::default();
    config.node_id = node_id.to_string();
    config.sync_interval = Duration::from_secs(600);
    config.op_timeout = Duration::from_secs(5);
    config
}

/// Spawn a node on the shared transport and start serving its endpoint
pub fn spawn_node(transport: &MemoryTransport, config: Config) -> TestNode {
    let node_id = config.node_id.clone();
    let cmd_url = format!("mem://{node_id}");
    let (peer_events_tx, peer_events_rx) = mpsc::channel(64);
    let kvstore = KvStore::new(&config, Arc::new(transport.clone()), peer_events_rx)
        .expect("test config must be valid");
    let inbound_rx = transport.register(&cmd_url, 256);
    kvstore.serve_inbound(inbound_rx);
    TestNode { kvstore, peer_events_tx, node_id, cmd_url }
}

/// Spawn a node with the default test configuration
pub fn spawn_default_node(transport: &MemoryTransport, node_id: &str) -> TestNode {
    spawn_node(transport, test_config(node_id))
}

/// The peer spec other nodes use to reach this node
pub fn peer_spec_of(node: &TestNode) -> PeerSpec {
    PeerSpec { cmd_url: node.cmd_url.clone(), ctrl_port: 0 }
}

/// Symmetrically peer two nodes in one area through the public API
pub async fn connect_nodes(area: &str, a: &TestNode, b: &TestNode) {
    let mut to_b = HashMap::new();
    to_b.insert(b.node_id.clone(), peer_spec_of(b));
    a.kvstore.add_update_kv_store_peers(area, to_b).await.expect("peering a -> b");

    let mut to_a = HashMap::new();
    to_a.insert(a.node_id.clone(), peer_spec_of(a));
    b.kvstore.add_update_kv_store_peers(area, to_a).await.expect("peering b -> a");
}

/// Build a full value record
pub fn make_value(version: i64, originator: &str, bytes: &[u8], ttl_ms: i64) -> Value {
    Value::new(version, originator, Some(bytes.to_vec()), ttl_ms, 0)
}

/// Build set params holding one key
pub fn set_of(key: &str, value: Value) -> KeySetParams {
    let mut key_vals = HashMap::new();
    key_vals.insert(key.to_string(), value);
    KeySetParams { key_vals, ..Default::default() }
}
