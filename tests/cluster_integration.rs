//! Integration tests for Redis Cluster operations.
//!
//! These tests require a real Redis Cluster running on localhost.
//! All tests are marked with #[ignore] by default.
//!
//! Setup with Docker:
//! ```bash
//! docker run -d --name redis-cluster \
//!   -p 7000-7005:7000-7005 \
//!   grokzen/redis-cluster:latest
//! ```
//!
//! Run tests:
//! ```bash
//! cargo test --test cluster_integration -- --ignored
//! ```

use std::time::Duration;

use bytes::Bytes;
use slotmux::cluster::{ensure_same_slot, ClusterClient};
use slotmux::{Cmd, Error, Result};

const SEEDS: &str = "127.0.0.1:7000,127.0.0.1:7001,127.0.0.1:7002";

/// Helper function to create a cluster client for testing.
async fn create_test_client() -> Result<ClusterClient> {
    ClusterClient::connect(SEEDS).await
}

#[tokio::test]
#[ignore]
async fn test_cluster_connect() {
    let client = create_test_client().await.expect("failed to connect");

    let node_count = client.node_count();
    assert!(node_count >= 3, "expected at least 3 nodes, got {}", node_count);
    assert!(client.is_fully_covered(), "cluster should cover all 16384 slots");
    assert!(client.primary_nodes().len() >= 3);
}

#[tokio::test]
#[ignore]
async fn test_cluster_basic_operations() {
    let client = create_test_client().await.expect("failed to connect");

    let key = "integration:test:basic";
    let value = Bytes::from("Hello, Cluster!");

    client.set(key, value.clone()).await.expect("SET failed");
    let retrieved = client.get(key).await.expect("GET failed");
    assert_eq!(retrieved, Some(value), "retrieved value should match");

    assert!(client.exists(key).await.expect("EXISTS failed"), "key should exist");
    assert_eq!(client.del(key).await.expect("DEL failed"), 1, "should delete 1 key");
    assert!(
        !client.exists(key).await.expect("EXISTS failed"),
        "key should not exist after deletion"
    );
}

#[tokio::test]
#[ignore]
async fn test_cluster_hash_tags() {
    let client = create_test_client().await.expect("failed to connect");

    let keys = ["user:{12345}:name", "user:{12345}:email", "user:{12345}:age"];
    let slot = ensure_same_slot(&keys).expect("keys with same hash tag should map to same slot");
    println!("All keys map to slot: {}", slot);

    client
        .mset(keys.iter().flat_map(|k| [*k, "v"]))
        .await
        .expect("MSET with hash tag failed");
    let values = client.mget(keys).await.expect("MGET failed");
    assert!(values.iter().all(|v| v.as_deref() == Some(b"v".as_slice())));

    for key in keys {
        client.del(key).await.expect("DEL failed");
    }
}

#[tokio::test]
#[ignore]
async fn test_cluster_multi_key_across_slots() {
    let client = create_test_client().await.expect("failed to connect");

    let keys: Vec<String> = (1..=20).map(|i| format!("test:key:{}", i)).collect();
    let pairs: Vec<String> = keys
        .iter()
        .flat_map(|k| [k.clone(), format!("value_{}", k)])
        .collect();
    client.mset(pairs).await.expect("MSET failed");

    let values = client.mget(keys.clone()).await.expect("MGET failed");
    for (key, value) in keys.iter().zip(values) {
        assert_eq!(value, Some(Bytes::from(format!("value_{}", key))));
    }

    for key in keys {
        assert_eq!(client.del(key).await.expect("DEL failed"), 1);
    }
}

#[tokio::test]
#[ignore]
async fn test_cluster_topology_refresh() {
    let client = create_test_client().await.expect("failed to connect");

    let node_count_before = client.node_count();
    assert!(client.refresh_topology().await.expect("refresh failed"));
    assert_eq!(
        node_count_before,
        client.node_count(),
        "node count should not change after refresh"
    );
    assert!(client.is_fully_covered());
}

#[tokio::test]
#[ignore]
async fn test_cluster_reset_rediscovers() {
    let client = create_test_client().await.expect("failed to connect");

    client.reset();
    assert_eq!(client.node_count(), 0);

    client
        .set("integration:reset", "after")
        .await
        .expect("SET after reset failed");
    assert!(client.is_fully_covered());
    client.del("integration:reset").await.expect("DEL failed");
}

#[tokio::test]
#[ignore]
async fn test_cluster_replica_reads() {
    let client = ClusterClient::builder()
        .seeds(SEEDS)
        .read_from_replicas(true)
        .build()
        .await
        .expect("failed to connect");

    client.set("integration:replica", "v").await.expect("SET failed");
    // Replication is asynchronous; give it a moment.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let value = client.get("integration:replica").await.expect("GET failed");
    assert_eq!(value, Some(Bytes::from("v")));
}

#[tokio::test]
#[ignore]
async fn test_cluster_broadcast_and_keyless() {
    let client = create_test_client().await.expect("failed to connect");

    client.ping_all().await.expect("PING on every primary failed");
    let reply = client
        .execute_keyless(&Cmd::new("PING"))
        .await
        .expect("keyless PING failed");
    assert_eq!(reply.as_bytes(), Some(b"PONG".as_slice()));
}

#[tokio::test]
#[ignore]
async fn test_cluster_cross_slot_error() {
    let client = create_test_client().await.expect("failed to connect");

    let cmd = Cmd::new("MGET").arg("cross:a").arg("cross:b");
    let result = client.execute("cross:a", &cmd).await;
    assert!(matches!(result, Err(Error::CrossSlot)));
}

#[tokio::test]
#[ignore]
async fn test_cluster_concurrent_operations() {
    let client = create_test_client().await.expect("failed to connect");

    let mut handles = vec![];
    for i in 0..50 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("concurrent:test:{}", i);
            let value = Bytes::from(format!("value_{}", i));
            client.set(key.clone(), value.clone()).await?;
            let retrieved = client.get(key.clone()).await?;
            assert_eq!(retrieved, Some(value));
            client.del(key).await?;
            Ok::<_, Error>(())
        }));
    }

    for handle in handles {
        handle.await.expect("task panicked").expect("operation failed");
    }
}

#[tokio::test]
#[ignore]
async fn test_cluster_unreachable_seed() {
    let result = ClusterClient::connect("127.0.0.1:1").await;
    match result {
        Err(err @ Error::TopologyUnavailable { .. }) => {
            assert_eq!(err.to_string(), "Could not initialize cluster slots cache.");
            assert_eq!(err.suppressed().len(), 1);
        }
        other => panic!("expected TopologyUnavailable, got {:?}", other.map(|_| ())),
    }
}
