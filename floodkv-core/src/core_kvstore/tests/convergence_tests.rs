/*
    Convergence tests

    Multi-node flooding scenarios: ring topologies, TTL refresh across
    replicas, and independent expiry on every node.
*/

use std::time::Duration;

use crate::core_kvstore::{KeyGetParams, MemoryTransport, Value};
use crate::test_utils::{
    connect_nodes, eventually, eventually_default, make_value, set_of, spawn_default_node,
    TestNode,
};

async fn holds_value(node: &TestNode, area: &str, key: &str, bytes: &[u8]) -> bool {
    match node
        .kvstore
        .get_kv_store_key_vals(area, KeyGetParams { keys: vec![key.to_string()] })
        .await
    {
        Ok(publication) => publication
            .key_vals
            .get(key)
            .map(|v| v.value.as_deref() == Some(bytes))
            .unwrap_or(false),
        Err(_) => false,
    }
}

async fn key_absent(node: &TestNode, area: &str, key: &str) -> bool {
    match node
        .kvstore
        .get_kv_store_key_vals(area, KeyGetParams { keys: vec![key.to_string()] })
        .await
    {
        Ok(publication) => !publication.key_vals.contains_key(key),
        Err(_) => false,
    }
}

#[tokio::test]
async fn test_write_and_read_across_two_nodes() {
    let transport = MemoryTransport::new();
    let a = spawn_default_node(&transport, "node-a");
    let b = spawn_default_node(&transport, "node-b");
    connect_nodes("0", &a, &b).await;

    let mut updates = b.kvstore.update_reader();

    a.kvstore
        .set_kv_store_key_vals("0", set_of("foo", make_value(1, "node-a", b"bar", 600_000)))
        .await
        .unwrap();

    assert!(eventually_default(|| holds_value(&b, "0", "foo", b"bar")).await);

    // the subscriber stream on b saw the merged delta
    let mut saw_foo = false;
    while let Ok(delta) = updates.try_recv() {
        saw_foo |= delta.key_vals.contains_key("foo");
    }
    assert!(saw_foo, "subscriber must observe the flooded key");

    a.kvstore.stop().await;
    b.kvstore.stop().await;
}

#[tokio::test]
async fn test_ring_of_four_converges() {
    let transport = MemoryTransport::new();
    let nodes: Vec<TestNode> = (0..4)
        .map(|i| spawn_default_node(&transport, &format!("ring-{i}")))
        .collect();

    // ring topology: 0-1, 1-2, 2-3, 3-0
    for i in 0..4 {
        connect_nodes("0", &nodes[i], &nodes[(i + 1) % 4]).await;
    }

    nodes[0]
        .kvstore
        .set_kv_store_key_vals("0", set_of("ring-key", make_value(1, "ring-0", b"around", 600_000)))
        .await
        .unwrap();

    for node in &nodes {
        assert!(
            eventually_default(|| holds_value(node, "0", "ring-key", b"around")).await,
            "node {} must converge",
            node.node_id
        );
    }

    // exactly one live record everywhere, and no publication loops ran wild
    for node in &nodes {
        let publication = node
            .kvstore
            .get_kv_store_key_vals("0", KeyGetParams { keys: vec!["ring-key".to_string()] })
            .await
            .unwrap();
        assert_eq!(publication.key_vals.len(), 1);
    }

    for node in &nodes {
        node.kvstore.stop().await;
    }
}

#[tokio::test]
async fn test_version_precedence_across_writers() {
    let transport = MemoryTransport::new();
    let a = spawn_default_node(&transport, "node-a");
    let b = spawn_default_node(&transport, "node-b");
    connect_nodes("0", &a, &b).await;

    // same version from two writers: the greater originator must win
    a.kvstore
        .set_kv_store_key_vals("0", set_of("x", make_value(1, "node-a", b"from-a", 600_000)))
        .await
        .unwrap();
    b.kvstore
        .set_kv_store_key_vals("0", set_of("x", make_value(1, "node-b", b"from-b", 600_000)))
        .await
        .unwrap();

    assert!(
        eventually_default(|| async {
            holds_value(&a, "0", "x", b"from-b").await && holds_value(&b, "0", "x", b"from-b").await
        })
        .await,
        "replicas must settle on the lexicographically greater originator"
    );

    // a higher version beats any originator
    a.kvstore
        .set_kv_store_key_vals("0", set_of("x", make_value(2, "node-a", b"v2", 600_000)))
        .await
        .unwrap();
    assert!(
        eventually_default(|| async {
            holds_value(&a, "0", "x", b"v2").await && holds_value(&b, "0", "x", b"v2").await
        })
        .await
    );

    a.kvstore.stop().await;
    b.kvstore.stop().await;
}

#[tokio::test]
async fn test_ttl_refresh_extends_lifetime() {
    let transport = MemoryTransport::new();
    let a = spawn_default_node(&transport, "node-a");
    let b = spawn_default_node(&transport, "node-b");
    connect_nodes("0", &a, &b).await;

    a.kvstore
        .set_kv_store_key_vals("0", set_of("y", make_value(5, "node-a", b"body", 3_000)))
        .await
        .unwrap();
    assert!(eventually_default(|| holds_value(&b, "0", "y", b"body")).await);

    // refresh before expiry: same record, bumped ttl-version, longer ttl
    let refresh = Value::new(5, "node-a", Some(b"body".to_vec()), 10_000, 1);
    a.kvstore.set_kv_store_key_vals("0", set_of("y", refresh)).await.unwrap();

    // well past the original 3s lifetime the key must still be alive
    tokio::time::sleep(Duration::from_millis(4_000)).await;
    assert!(holds_value(&a, "0", "y", b"body").await, "refresh must keep the key on a");
    assert!(holds_value(&b, "0", "y", b"body").await, "refresh must keep the key on b");

    a.kvstore.stop().await;
    b.kvstore.stop().await;
}

#[tokio::test]
async fn test_expiry_removes_key_on_every_node() {
    let transport = MemoryTransport::new();
    let a = spawn_default_node(&transport, "node-a");
    let b = spawn_default_node(&transport, "node-b");
    connect_nodes("0", &a, &b).await;

    // wait out the initial sync first so the key actually reaches b
    assert!(
        eventually_default(|| async {
            a.kvstore.get_kv_store_peer_state("0", "node-b").await.unwrap()
                == Some(crate::core_kvstore::PeerState::Synced)
        })
        .await
    );

    let mut updates_b = b.kvstore.update_reader();
    a.kvstore
        .set_kv_store_key_vals("0", set_of("ephemeral", make_value(1, "node-a", b"v", 1_500)))
        .await
        .unwrap();
    assert!(eventually_default(|| holds_value(&b, "0", "ephemeral", b"v")).await);

    // each node expires the key from its own countdown queue
    assert!(eventually(Duration::from_secs(6), || key_absent(&a, "0", "ephemeral")).await);
    assert!(eventually(Duration::from_secs(6), || key_absent(&b, "0", "ephemeral")).await);

    // b announced the removal to its subscribers exactly once
    let mut deletions = 0;
    while let Ok(delta) = updates_b.try_recv() {
        deletions += delta.expired_keys.iter().filter(|k| k.as_str() == "ephemeral").count();
    }
    assert_eq!(deletions, 1);

    a.kvstore.stop().await;
    b.kvstore.stop().await;
}
