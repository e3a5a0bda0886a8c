/*
    Public API integration tests

    Drive a single store node end to end through the supervisor API:
    writes, reads, filtered dumps, hash dumps, peers, and counters.
*/

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use floodkv_core::core_kvstore::{
    FilterOperator, KeyDumpParams, KeyGetParams, KeySetParams, KvStoreError, MemoryTransport,
    PeerSpec, Value,
};
use floodkv_core::test_utils::{make_value, set_of, spawn_default_node};

#[tokio::test]
async fn test_write_and_read() {
    let transport = MemoryTransport::new();
    let node = spawn_default_node(&transport, "solo");

    node.kvstore
        .set_kv_store_key_vals("0", set_of("foo", make_value(1, "solo", b"bar", 10_000)))
        .await
        .unwrap();

    let publication = node
        .kvstore
        .get_kv_store_key_vals("0", KeyGetParams { keys: vec!["foo".to_string()] })
        .await
        .unwrap();
    let value = publication.key_vals.get("foo").expect("written key must be readable");
    assert_eq!(value.version, 1);
    assert_eq!(value.value.as_deref(), Some(b"bar".as_slice()));

    node.kvstore.stop().await;
}

#[tokio::test]
async fn test_invalid_writes_are_rejected() {
    let transport = MemoryTransport::new();
    let node = spawn_default_node(&transport, "solo");

    // no key-values at all
    let err = node
        .kvstore
        .set_kv_store_key_vals("0", KeySetParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KvStoreError::InvalidArgument(_)));

    // versions start at one
    let err = node
        .kvstore
        .set_kv_store_key_vals("0", set_of("k", make_value(0, "solo", b"v", 10_000)))
        .await
        .unwrap_err();
    assert!(matches!(err, KvStoreError::InvalidArgument(_)));

    node.kvstore.stop().await;
}

#[tokio::test]
async fn test_filtered_dumps() {
    let transport = MemoryTransport::new();
    let node = spawn_default_node(&transport, "solo");

    node.kvstore
        .set_kv_store_key_vals("0", set_of("adj:r1", make_value(1, "solo", b"a", 60_000)))
        .await
        .unwrap();
    node.kvstore
        .set_kv_store_key_vals("0", set_of("prefix:r1", make_value(1, "other", b"p", 60_000)))
        .await
        .unwrap();

    let all = node
        .kvstore
        .dump_kv_store_keys(KeyDumpParams::default(), BTreeSet::new())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].key_vals.len(), 2);

    let adj_only = node
        .kvstore
        .dump_kv_store_keys(
            KeyDumpParams { prefixes: vec!["adj:".to_string()], ..Default::default() },
            BTreeSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(adj_only[0].key_vals.len(), 1);
    assert!(adj_only[0].key_vals.contains_key("adj:r1"));

    // AND of prefix and originator
    let mut originators = BTreeSet::new();
    originators.insert("solo".to_string());
    let and_dump = node
        .kvstore
        .dump_kv_store_keys(
            KeyDumpParams {
                prefixes: vec!["prefix:".to_string()],
                originator_ids: originators,
                operator: FilterOperator::And,
                ..Default::default()
            },
            BTreeSet::new(),
        )
        .await
        .unwrap();
    assert!(and_dump[0].key_vals.is_empty());

    // hash dumps carry no payload bytes
    let hashes = node
        .kvstore
        .dump_kv_store_hashes("0", KeyDumpParams::default())
        .await
        .unwrap();
    assert_eq!(hashes.key_vals.len(), 2);
    assert!(hashes.key_vals.values().all(|v: &Value| v.value.is_none() && v.hash.is_some()));

    node.kvstore.stop().await;
}

#[tokio::test]
async fn test_dump_unknown_selected_area() {
    let transport = MemoryTransport::new();
    let node = spawn_default_node(&transport, "solo");

    let mut select = BTreeSet::new();
    select.insert("mars".to_string());
    let err = node
        .kvstore
        .dump_kv_store_keys(KeyDumpParams::default(), select)
        .await
        .unwrap_err();
    assert!(matches!(err, KvStoreError::NotFound(_)));

    node.kvstore.stop().await;
}

#[tokio::test]
async fn test_peer_management_api() {
    let transport = MemoryTransport::new();
    let node = spawn_default_node(&transport, "solo");

    let mut peers = HashMap::new();
    peers.insert(
        "neighbor".to_string(),
        PeerSpec { cmd_url: "mem://neighbor".to_string(), ctrl_port: 2018 },
    );
    node.kvstore.add_update_kv_store_peers("0", peers).await.unwrap();

    let dumped = node.kvstore.get_kv_store_peers("0").await.unwrap();
    assert_eq!(dumped.len(), 1);
    assert_eq!(dumped["neighbor"].cmd_url, "mem://neighbor");

    node.kvstore
        .delete_kv_store_peers("0", vec!["neighbor".to_string()])
        .await
        .unwrap();
    assert!(node.kvstore.get_kv_store_peers("0").await.unwrap().is_empty());

    node.kvstore.stop().await;
}

#[tokio::test]
async fn test_counters_reflect_activity() {
    let transport = MemoryTransport::new();
    let node = spawn_default_node(&transport, "solo");

    node.kvstore
        .set_kv_store_key_vals("0", set_of("k1", make_value(1, "solo", b"v", 60_000)))
        .await
        .unwrap();
    node.kvstore
        .set_kv_store_key_vals("0", set_of("k2", make_value(1, "solo", b"v", 60_000)))
        .await
        .unwrap();

    let counters = node.kvstore.get_counters().await.unwrap();
    assert_eq!(counters["kvstore.num_keys.0"], 2);
    assert_eq!(counters["kvstore.keys_merged"], 2);
    assert!(counters.contains_key("kvstore.ttl_queue_depth.0"));

    node.kvstore.stop().await;
}

#[tokio::test]
async fn test_expired_key_disappears_from_reads() {
    let transport = MemoryTransport::new();
    let node = spawn_default_node(&transport, "solo");

    node.kvstore
        .set_kv_store_key_vals("0", set_of("fleeting", make_value(1, "solo", b"v", 200)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;

    let publication = node
        .kvstore
        .get_kv_store_key_vals("0", KeyGetParams { keys: vec!["fleeting".to_string()] })
        .await
        .unwrap();
    assert!(publication.key_vals.is_empty(), "expired key must not be readable");

    let dumps = node
        .kvstore
        .dump_kv_store_keys(KeyDumpParams::default(), BTreeSet::new())
        .await
        .unwrap();
    assert!(dumps[0].key_vals.is_empty(), "expired key must not appear in dumps");

    node.kvstore.stop().await;
}
