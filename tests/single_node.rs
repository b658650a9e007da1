//! End-to-end tests against a real single-node cluster.

use std::collections::BTreeMap;
use std::time::Duration;

use registry_store::ClusterState;
use registry_store::Row;
use registry_store::Store;
use registry_store::StoreConfig;
use registry_store::StoreError;
use tempfile::TempDir;

fn node_config(dir: &TempDir, node_id: u64) -> StoreConfig {
    StoreConfig::new(node_id, dir.path(), "127.0.0.1:0")
}

async fn leader_store(dir: &TempDir) -> Store {
    let store = Store::open(node_config(dir, 1), true).await.unwrap();
    store
        .wait_for_leader(Duration::from_secs(10))
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn single_node_write_then_read() {
    let dir = TempDir::new().unwrap();
    let store = leader_store(&dir).await;

    store.create_bucket(b"ns").await.unwrap();
    store.update(b"ns", b"k1", b"v1").await.unwrap();

    // First read populates the cache, second is served from it.
    assert_eq!(store.view(b"ns", b"k1").unwrap().as_deref(), Some(&b"v1"[..]));
    assert_eq!(store.view(b"ns", b"k1").unwrap().as_deref(), Some(&b"v1"[..]));

    assert!(store.is_leader());
    assert_eq!(store.state(), ClusterState::Leader);

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn cache_stays_coherent_across_updates() {
    let dir = TempDir::new().unwrap();
    let store = leader_store(&dir).await;

    store.create_bucket(b"ns").await.unwrap();
    store.update(b"ns", b"k1", b"v1").await.unwrap();
    assert_eq!(store.view(b"ns", b"k1").unwrap().as_deref(), Some(&b"v1"[..]));

    // The second write must invalidate the cached v1 immediately.
    store.update(b"ns", b"k1", b"v2").await.unwrap();
    assert_eq!(store.view(b"ns", b"k1").unwrap().as_deref(), Some(&b"v2"[..]));

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn remove_key_deletes_and_invalidates() {
    let dir = TempDir::new().unwrap();
    let store = leader_store(&dir).await;

    store.create_bucket(b"ns").await.unwrap();
    store.update(b"ns", b"k1", b"v1").await.unwrap();
    assert!(store.view(b"ns", b"k1").unwrap().is_some());

    store.remove_key(b"ns", b"k1").await.unwrap();
    assert_eq!(store.view(b"ns", b"k1").unwrap(), None);

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn bucket_drop_removes_everything_under_it() {
    let dir = TempDir::new().unwrap();
    let store = leader_store(&dir).await;

    store.create_bucket(b"ns").await.unwrap();
    store.update(b"ns", b"k", b"v").await.unwrap();
    assert!(store.view(b"ns", b"k").unwrap().is_some());

    store.remove_bucket(b"ns").await.unwrap();

    match store.view(b"ns", b"k") {
        Err(StoreError::BucketNotFound { bucket }) => assert_eq!(bucket, "ns"),
        other => panic!("expected BucketNotFound, got {other:?}"),
    }

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn create_bucket_twice_surfaces_the_apply_error() {
    let dir = TempDir::new().unwrap();
    let store = leader_store(&dir).await;

    store.create_bucket(b"ns").await.unwrap();
    match store.create_bucket(b"ns").await {
        Err(StoreError::Apply { reason }) => assert!(reason.contains("already exists")),
        other => panic!("expected Apply error, got {other:?}"),
    }
    store.create_bucket_if_not_exist(b"ns").await.unwrap();

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn view_prefix_returns_matching_keys() {
    let dir = TempDir::new().unwrap();
    let store = leader_store(&dir).await;

    store.create_bucket(b"b").await.unwrap();
    store.update(b"b", b"alpha", b"1").await.unwrap();
    store.update(b"b", b"alphabet", b"2").await.unwrap();
    store.update(b"b", b"beta", b"3").await.unwrap();

    let hits = store.view_prefix(b"b", b"alpha").unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits.get("alpha").map(String::as_str), Some("1"));
    assert_eq!(hits.get("alphabet").map(String::as_str), Some("2"));

    let all = store.view_prefix(b"b", b"").unwrap();
    assert_eq!(all.len(), 3);

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn batch_applies_atomically() {
    let dir = TempDir::new().unwrap();
    let store = leader_store(&dir).await;

    store.create_bucket(b"ns").await.unwrap();
    store
        .batch(vec![
            Row::put("ns", "k1", "v1"),
            Row::put("ns", "k2", "v2"),
        ])
        .await
        .unwrap();

    assert_eq!(store.view(b"ns", b"k1").unwrap().as_deref(), Some(&b"v1"[..]));
    assert_eq!(store.view(b"ns", b"k2").unwrap().as_deref(), Some(&b"v2"[..]));

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn empty_batch_is_rejected_without_a_proposal() {
    let dir = TempDir::new().unwrap();
    let store = leader_store(&dir).await;

    assert!(matches!(store.batch(vec![]).await, Err(StoreError::EmptyBatch)));

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn sessions_replicate_and_delete() {
    let dir = TempDir::new().unwrap();
    let store = leader_store(&dir).await;

    assert_eq!(store.get_session("alice"), None);

    store.set_session("alice", "token-1").await.unwrap();
    assert_eq!(store.get_session("alice").as_deref(), Some("token-1"));

    store.del_session("alice").await.unwrap();
    assert_eq!(store.get_session("alice"), None);

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn api_peers_track_live_members_only() {
    let dir = TempDir::new().unwrap();
    let store = leader_store(&dir).await;

    let mut peers = BTreeMap::new();
    peers.insert(store.addr().to_string(), "127.0.0.1:9000".to_string());
    peers.insert("10.0.0.9:7000".to_string(), "10.0.0.9:9000".to_string());
    store.update_api_peers(peers).await.unwrap();

    let live = store.api_peers();
    assert_eq!(live.len(), 1);
    assert_eq!(
        live.get(store.addr()).map(String::as_str),
        Some("127.0.0.1:9000")
    );
    // The entry for the departed address was pruned in place.
    assert_eq!(store.peer("10.0.0.9:7000"), None);

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn backup_then_restore_reproduces_the_exact_state() {
    let dir = TempDir::new().unwrap();
    let store = leader_store(&dir).await;

    store.create_bucket(b"ns").await.unwrap();
    store.update(b"ns", b"k1", b"v1").await.unwrap();
    store.update(b"ns", b"k2", b"v2").await.unwrap();

    let backup = store.backup().await.unwrap();

    // Diverge from the backup, then restore over the divergence.
    store.update(b"ns", b"k1", b"changed").await.unwrap();
    store.remove_key(b"ns", b"k2").await.unwrap();

    let backup_path = dir.path().join("backup.db");
    std::fs::write(&backup_path, &backup).unwrap();
    store.restore(&backup_path).await.unwrap();

    assert_eq!(store.view(b"ns", b"k1").unwrap().as_deref(), Some(&b"v1"[..]));
    assert_eq!(store.view(b"ns", b"k2").unwrap().as_deref(), Some(&b"v2"[..]));

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn non_leader_writes_fail_fast_and_mutate_nothing() {
    let dir = TempDir::new().unwrap();
    // No single-node bootstrap: the node never becomes leader.
    let store = Store::open(node_config(&dir, 1), false).await.unwrap();

    match store.update(b"ns", b"k", b"v").await {
        Err(StoreError::NotLeader { .. }) => {}
        other => panic!("expected NotLeader, got {other:?}"),
    }
    match store.create_bucket(b"ns").await {
        Err(StoreError::NotLeader { .. }) => {}
        other => panic!("expected NotLeader, got {other:?}"),
    }
    match store.set_session("alice", "token").await {
        Err(StoreError::NotLeader { .. }) => {}
        other => panic!("expected NotLeader, got {other:?}"),
    }
    match store.backup().await {
        Err(StoreError::NotLeader { .. }) => {}
        other => panic!("expected NotLeader, got {other:?}"),
    }

    // Local state is untouched: the bucket was never created and no
    // session appeared.
    assert!(matches!(
        store.view(b"ns", b"k"),
        Err(StoreError::BucketNotFound { .. })
    ));
    assert_eq!(store.get_session("alice"), None);

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn data_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = leader_store(&dir).await;
        store.create_bucket(b"ns").await.unwrap();
        store.update(b"ns", b"k1", b"v1").await.unwrap();
        store.close(true).await.unwrap();
    }

    let store = Store::open(node_config(&dir, 1), true).await.unwrap();
    store
        .wait_for_leader(Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(store.view(b"ns", b"k1").unwrap().as_deref(), Some(&b"v1"[..]));
    store.close(true).await.unwrap();
}

#[tokio::test]
async fn wait_for_leader_times_out_without_a_cluster() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(node_config(&dir, 1), false).await.unwrap();

    match store.wait_for_leader(Duration::from_millis(300)).await {
        Err(StoreError::WaitForLeaderTimeout { .. }) => {}
        other => panic!("expected WaitForLeaderTimeout, got {other:?}"),
    }

    store.close(true).await.unwrap();
}
