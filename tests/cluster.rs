//! Two-node cluster tests over real TCP transport.

use std::time::Duration;
use std::time::Instant;

use registry_store::Store;
use registry_store::StoreConfig;
use registry_store::StoreError;
use tempfile::TempDir;

fn node_config(dir: &TempDir, node_id: u64) -> StoreConfig {
    StoreConfig::new(node_id, dir.path(), "127.0.0.1:0")
}

/// Poll `read` until it yields the expected value or the deadline passes.
async fn await_value(store: &Store, bucket: &[u8], key: &[u8], expected: &[u8]) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if let Ok(Some(value)) = store.view(bucket, key) {
            if value == expected {
                return;
            }
        }
        if Instant::now() >= deadline {
            panic!(
                "value for {}/{} did not replicate in time",
                String::from_utf8_lossy(bucket),
                String::from_utf8_lossy(key)
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn follower_replicates_writes_and_rejects_its_own() {
    let dir1 = TempDir::new().unwrap();
    let dir2 = TempDir::new().unwrap();

    let leader = Store::open(node_config(&dir1, 1), true).await.unwrap();
    leader
        .wait_for_leader(Duration::from_secs(10))
        .await
        .unwrap();

    let follower = Store::open(node_config(&dir2, 2), false).await.unwrap();
    leader.join(2, follower.addr()).await.unwrap();

    // A committed write on the leader becomes visible on the follower.
    leader.create_bucket(b"ns").await.unwrap();
    leader.update(b"ns", b"k1", b"v1").await.unwrap();
    await_value(&follower, b"ns", b"k1", b"v1").await;

    // Sessions replicate through the same log.
    leader.set_session("alice", "token").await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(15);
    while follower.get_session("alice").is_none() {
        assert!(Instant::now() < deadline, "session did not replicate");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The follower refuses writes and its state is unchanged by the attempt.
    match follower.update(b"ns", b"k1", b"poison").await {
        Err(StoreError::NotLeader { leader: hint }) => assert_eq!(hint, Some(1)),
        other => panic!("expected NotLeader, got {other:?}"),
    }
    assert_eq!(
        follower.view(b"ns", b"k1").unwrap().as_deref(),
        Some(&b"v1"[..])
    );

    // Both members agree on the cluster shape.
    assert_eq!(leader.nodes().len(), 2);
    assert_eq!(leader.leader_id(), Some(1));

    follower.close(true).await.unwrap();
    leader.close(true).await.unwrap();
}
