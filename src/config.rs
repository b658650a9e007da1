//! Store configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::NodeId;

/// Primary database file, owned exclusively by the engine.
pub(crate) const DB_FILE: &str = "registry.db";
/// Subdirectory holding the consensus state.
pub(crate) const RAFT_DIR: &str = "raft";
/// Replicated log and stable store, owned exclusively by the log component.
pub(crate) const RAFT_DB_FILE: &str = "raft.db";
/// Snapshot repository directory under [`RAFT_DIR`].
pub(crate) const SNAPSHOT_DIR: &str = "snapshots";
/// Optional bootstrap membership file under [`RAFT_DIR`].
pub(crate) const PEERS_FILE: &str = "peers.json";

/// Upper bound on rows per batch proposal.
pub const MAX_BATCH_ROWS: usize = 4096;

/// Configuration for a store node.
///
/// Defaults match the production deployment: a 50 MiB cache budget, snapshots
/// every 500 log entries with 1000 trailing entries retained, a 1 s
/// heartbeat, and a 10 s proposal timeout.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Raft identity of this node. Must be stable across restarts.
    pub node_id: NodeId,
    /// Root directory for the database, log, and snapshots.
    pub data_dir: PathBuf,
    /// Listen address for raft RPC, e.g. `127.0.0.1:7000`. Port 0 binds an
    /// ephemeral port; the bound address is what peers must dial.
    pub raft_bind: String,
    /// Byte budget for the read cache. Zero disables capacity eviction.
    pub max_cache_bytes: u64,
    /// Log entries between snapshots.
    pub snapshot_threshold: u64,
    /// Log entries retained after a snapshot so followers can catch up
    /// without a full snapshot transfer.
    pub trailing_logs: u64,
    /// Leader heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Election timeout lower bound.
    pub election_timeout_min: Duration,
    /// Election timeout upper bound.
    pub election_timeout_max: Duration,
    /// Bound on a single proposal round-trip through consensus.
    pub apply_timeout: Duration,
    /// Poll interval while waiting for a leader.
    pub leader_wait_delay: Duration,
    /// Bound on waiting for an in-flight snapshot restore.
    pub snapshot_wait_timeout: Duration,
    /// Number of snapshots retained on disk.
    pub retain_snapshots: usize,
}

impl StoreConfig {
    /// Configuration with production defaults for the given identity.
    pub fn new(node_id: NodeId, data_dir: impl Into<PathBuf>, raft_bind: impl Into<String>) -> Self {
        Self {
            node_id,
            data_dir: data_dir.into(),
            raft_bind: raft_bind.into(),
            max_cache_bytes: 50 * 1024 * 1024,
            snapshot_threshold: 500,
            trailing_logs: 1000,
            heartbeat_interval: Duration::from_secs(1),
            election_timeout_min: Duration::from_secs(2),
            election_timeout_max: Duration::from_secs(3),
            apply_timeout: Duration::from_secs(10),
            leader_wait_delay: Duration::from_millis(100),
            snapshot_wait_timeout: Duration::from_secs(60),
            retain_snapshots: 2,
        }
    }

    /// Path of the primary database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    /// Path of the raft state directory.
    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join(RAFT_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_values() {
        let config = StoreConfig::new(1, "/tmp/registry", "127.0.0.1:0");
        assert_eq!(config.max_cache_bytes, 50 * 1024 * 1024);
        assert_eq!(config.snapshot_threshold, 500);
        assert_eq!(config.trailing_logs, 1000);
        assert_eq!(config.apply_timeout, Duration::from_secs(10));
        assert_eq!(config.leader_wait_delay, Duration::from_millis(100));
        assert_eq!(config.snapshot_wait_timeout, Duration::from_secs(60));
        assert_eq!(config.retain_snapshots, 2);
    }

    #[test]
    fn derived_paths() {
        let config = StoreConfig::new(1, "/data", "127.0.0.1:0");
        assert_eq!(config.db_path(), PathBuf::from("/data/registry.db"));
        assert_eq!(config.raft_dir(), PathBuf::from("/data/raft"));
    }
}
