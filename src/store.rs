//! The replicated store facade.
//!
//! All mutation is ordered through consensus: a write on any member checks
//! local leadership, encodes a [`Command`], and proposes it; the committed
//! entry is applied on every replica and the proposing caller receives the
//! apply result. Reads consult the cache first and fall back to a read-only
//! engine transaction, populating the cache on a hit. Reads on the leader
//! observe all of its committed writes; reads on followers may lag by
//! replication.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use openraft::error::ClientWriteError;
use openraft::error::InitializeError;
use openraft::error::RaftError;
#[allow(deprecated)]
use openraft::storage::Adaptor;
use openraft::BasicNode;
use openraft::Config as RaftConfig;
use openraft::Raft;
use openraft::ServerState;
use openraft::SnapshotPolicy;
use parking_lot::Mutex;
use snafu::ResultExt;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::cache::Cache;
use crate::config::StoreConfig;
use crate::config::MAX_BATCH_ROWS;
use crate::config::PEERS_FILE;
use crate::config::RAFT_DB_FILE;
use crate::config::SNAPSHOT_DIR;
use crate::engine::Engine;
use crate::error::IoSnafu;
use crate::error::StoreError;
use crate::raft::Fsm;
use crate::raft::Network;
use crate::raft::RaftServer;
use crate::raft::RaftStore;
use crate::raft::SnapshotRepo;
use crate::types::ClusterState;
use crate::types::Command;
use crate::types::NodeId;
use crate::types::Row;
use crate::types::TypeConfig;

/// A bucketed key-value store whose writes are ordered through Raft
/// consensus: values change only when a majority of the cluster agrees.
pub struct Store {
    config: StoreConfig,
    raft_addr: String,
    fsm: Arc<Fsm>,
    raft: Raft<TypeConfig>,
    server: Mutex<Option<RaftServer>>,
}

impl Store {
    /// Open the store under `config.data_dir` and start serving raft RPC.
    ///
    /// If `enable_single` is set and no peer list is present, the node
    /// bootstraps itself as a single-member cluster and elects itself
    /// leader. Otherwise a non-empty `raft/peers.json` initializes the
    /// membership on first start.
    #[allow(deprecated)]
    pub async fn open(config: StoreConfig, enable_single: bool) -> Result<Self, StoreError> {
        let raft_dir = config.raft_dir();
        std::fs::create_dir_all(&raft_dir).context(IoSnafu)?;

        let engine = Engine::open(config.db_path())?;
        let cache = Cache::new(config.max_cache_bytes, None);
        let fsm = Arc::new(Fsm::new(engine, cache));
        let snapshots = Arc::new(
            SnapshotRepo::open(raft_dir.join(SNAPSHOT_DIR), config.retain_snapshots)
                .context(IoSnafu)?,
        );
        let log_store = RaftStore::open(&raft_dir.join(RAFT_DB_FILE), fsm.clone(), snapshots)?;

        let peers = read_peers_json(&raft_dir.join(PEERS_FILE))?;

        let raft_config = RaftConfig {
            cluster_name: "registry".to_string(),
            heartbeat_interval: config.heartbeat_interval.as_millis() as u64,
            election_timeout_min: config.election_timeout_min.as_millis() as u64,
            election_timeout_max: config.election_timeout_max.as_millis() as u64,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(config.snapshot_threshold),
            max_in_snapshot_log_to_keep: config.trailing_logs,
            install_snapshot_timeout: config.snapshot_wait_timeout.as_millis() as u64,
            ..Default::default()
        };
        let raft_config = Arc::new(raft_config.validate().map_err(|e| StoreError::Raft {
            reason: e.to_string(),
        })?);

        let (log, state_machine) = Adaptor::new(log_store);
        let raft = Raft::new(config.node_id, raft_config, Network, log, state_machine)
            .await
            .map_err(|e| StoreError::Raft {
                reason: e.to_string(),
            })?;

        let server = RaftServer::bind(&config.raft_bind, raft.clone())
            .await
            .context(IoSnafu)?;
        let raft_addr = server.local_addr().to_string();

        let store = Self {
            config,
            raft_addr,
            fsm,
            raft,
            server: Mutex::new(Some(server)),
        };

        if enable_single && peers.len() <= 1 {
            info!("enabling single-node mode");
            let members =
                BTreeMap::from([(store.config.node_id, BasicNode::new(&store.raft_addr))]);
            store.initialize(members).await?;
        } else if !peers.is_empty() {
            let members: BTreeMap<NodeId, BasicNode> = peers
                .iter()
                .map(|(id, addr)| (*id, BasicNode::new(addr)))
                .collect();
            store.initialize(members).await?;
        }

        info!(node_id = store.config.node_id, addr = %store.raft_addr, "store opened");
        Ok(store)
    }

    async fn initialize(&self, members: BTreeMap<NodeId, BasicNode>) -> Result<(), StoreError> {
        match self.raft.initialize(members).await {
            Ok(()) => Ok(()),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                debug!("cluster already initialized");
                Ok(())
            }
            Err(err) => Err(StoreError::Raft {
                reason: err.to_string(),
            }),
        }
    }

    /// Root data directory of this node.
    pub fn path(&self) -> &Path {
        &self.config.data_dir
    }

    /// Bound raft RPC address of this node.
    pub fn addr(&self) -> &str {
        &self.raft_addr
    }

    /// Raft identity of this node.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Whether the local node is currently the cluster leader.
    pub fn is_leader(&self) -> bool {
        self.state() == ClusterState::Leader
    }

    /// Raft role of the local node.
    pub fn state(&self) -> ClusterState {
        match self.raft.metrics().borrow().state {
            ServerState::Leader => ClusterState::Leader,
            ServerState::Follower => ClusterState::Follower,
            ServerState::Candidate => ClusterState::Candidate,
            ServerState::Shutdown => ClusterState::Shutdown,
            ServerState::Learner => ClusterState::Unknown,
        }
    }

    /// Id of the current leader, if one is known.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Raft address of the current leader, if one is known.
    pub fn leader_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|node| node.addr.clone())
    }

    /// Current members as `(id, raft address)` pairs.
    pub fn nodes(&self) -> Vec<(NodeId, String)> {
        let metrics = self.raft.metrics().borrow().clone();
        metrics
            .membership_config
            .membership()
            .nodes()
            .map(|(id, node)| (*id, node.addr.clone()))
            .collect()
    }

    /// API address registered for `raft_addr`, if any.
    pub fn peer(&self, raft_addr: &str) -> Option<String> {
        self.fsm.meta().addr_for_peer(raft_addr)
    }

    /// The raft-address -> API-address map, restricted to live members.
    /// Entries for departed peers are pruned lazily on this read path.
    pub fn api_peers(&self) -> HashMap<String, String> {
        let live: HashSet<String> = self
            .nodes()
            .into_iter()
            .map(|(_, addr)| addr)
            .collect();
        self.fsm.meta().project(&live)
    }

    /// Replicate API-address pairs into the cluster meta. Leader-only.
    pub async fn update_api_peers(
        &self,
        peers: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        self.propose(Command::SetPeer { peers }).await
    }

    /// Receiver observing the fatal-shutdown reason raised when the engine
    /// cannot be reopened after a restore.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.fsm.subscribe_fatal()
    }

    /// Block until a leader is known, polling every `leader_wait_delay`,
    /// then until any in-flight snapshot restore completes. Returns the
    /// leader's raft address.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(self.config.leader_wait_delay);
        let leader = loop {
            ticker.tick().await;
            if let Some(addr) = self.leader_addr() {
                break addr;
            }
            if Instant::now() >= deadline {
                return Err(StoreError::WaitForLeaderTimeout {
                    duration_ms: timeout.as_millis() as u64,
                });
            }
        };

        if !self.fsm.wait_ready(self.config.snapshot_wait_timeout).await {
            return Err(StoreError::SnapshotWaitTimeout {
                duration_ms: self.config.snapshot_wait_timeout.as_millis() as u64,
            });
        }
        Ok(leader)
    }

    /// Value for `key` in `bucket`: cache first, then a read-only engine
    /// transaction, populating the cache on a found value.
    pub fn view(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(value) = self.fsm.cache().get(bucket, key) {
            return Ok(Some(value));
        }

        let value = self.fsm.engine().view(bucket, key)?;
        if let Some(v) = &value {
            self.fsm.cache().add(bucket, key, v);
        }
        Ok(value)
    }

    /// Every key under `bucket` starting with `prefix`, as strings. Empty
    /// values are skipped; an empty prefix returns the whole bucket.
    pub fn view_prefix(
        &self,
        bucket: &[u8],
        prefix: &[u8],
    ) -> Result<HashMap<String, String>, StoreError> {
        let rows = self.fsm.engine().prefix_scan(bucket, prefix)?;
        Ok(rows
            .into_iter()
            .map(|(k, v)| {
                (
                    String::from_utf8_lossy(&k).into_owned(),
                    String::from_utf8_lossy(&v).into_owned(),
                )
            })
            .collect())
    }

    /// Replicate a single-row write. Leader-only.
    #[instrument(skip(self, value))]
    pub async fn update(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.propose(Command::Update {
            row: Row::put(bucket, key, value),
        })
        .await
    }

    /// Replicate a multi-row write applied under one engine transaction.
    /// Leader-only.
    #[instrument(skip(self, rows))]
    pub async fn batch(&self, rows: Vec<Row>) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Err(StoreError::EmptyBatch);
        }
        if rows.len() > MAX_BATCH_ROWS {
            return Err(StoreError::BatchTooLarge {
                size: rows.len(),
                max: MAX_BATCH_ROWS,
            });
        }
        self.propose(Command::Batch { rows }).await
    }

    /// Replicate a single-key delete. Leader-only.
    pub async fn remove_key(&self, bucket: &[u8], key: &[u8]) -> Result<(), StoreError> {
        self.propose(Command::RemoveKey {
            row: Row::delete(bucket, key),
        })
        .await
    }

    /// Replicate bucket creation; fails if the bucket exists. Leader-only.
    pub async fn create_bucket(&self, name: &[u8]) -> Result<(), StoreError> {
        self.propose(Command::CreateBucket {
            name: name.to_vec(),
        })
        .await
    }

    /// Replicate idempotent bucket creation. Leader-only.
    pub async fn create_bucket_if_not_exist(&self, name: &[u8]) -> Result<(), StoreError> {
        self.propose(Command::CreateBucketIfNotExist {
            name: name.to_vec(),
        })
        .await
    }

    /// Replicate bucket removal, dropping every key under it. Leader-only.
    #[instrument(skip(self))]
    pub async fn remove_bucket(&self, name: &[u8]) -> Result<(), StoreError> {
        self.propose(Command::RemoveBucket {
            name: name.to_vec(),
        })
        .await
    }

    /// Session token for `key`. Served locally on any member; a follower
    /// that just missed a replicated write gets one local retry.
    pub fn get_session(&self, key: &str) -> Option<String> {
        match self.fsm.sessions().get(key) {
            Some(value) => Some(value),
            None => self.fsm.sessions().get(key),
        }
    }

    /// Replicate a session write. Leader-only.
    pub async fn set_session(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.propose(Command::SetSession {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// Replicate a session delete. Leader-only.
    pub async fn del_session(&self, key: &str) -> Result<(), StoreError> {
        self.propose(Command::DelSession {
            key: key.to_string(),
        })
        .await
    }

    /// Consistent copy of the whole database file. Leader-only.
    #[instrument(skip(self))]
    pub async fn backup(&self) -> Result<Vec<u8>, StoreError> {
        self.ensure_leader()?;
        self.fsm.database_bytes()
    }

    /// Replicate installation of a backup file over the database. The file
    /// must exist at `backup_path` on every member. Leader-only.
    #[instrument(skip(self))]
    pub async fn restore(&self, backup_path: &Path) -> Result<(), StoreError> {
        self.propose(Command::Restore {
            backup_path: backup_path.display().to_string(),
        })
        .await
    }

    /// Add the node at `addr` as a voting member. The node must already be
    /// serving raft RPC at that address. Leader-only.
    #[instrument(skip(self))]
    pub async fn join(&self, id: NodeId, addr: &str) -> Result<(), StoreError> {
        self.ensure_leader()?;
        info!(id, addr, "received join request for remote node");

        self.raft
            .add_learner(id, BasicNode::new(addr), true)
            .await
            .map_err(write_error_to_store)?;

        let mut voters = self.voter_ids();
        voters.insert(id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(write_error_to_store)?;

        info!(id, addr, "node joined");
        Ok(())
    }

    /// Remove the member `id` from the cluster. Leader-only.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: NodeId) -> Result<(), StoreError> {
        self.ensure_leader()?;
        info!(id, "received request to remove node");

        let mut voters = self.voter_ids();
        voters.remove(&id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(write_error_to_store)?;

        info!(id, "node removed");
        Ok(())
    }

    /// Close the store: stop raft RPC, close the engine, and shut down
    /// consensus. With `wait` unset the consensus shutdown happens in the
    /// background.
    pub async fn close(&self, wait: bool) -> Result<(), StoreError> {
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.shutdown().await;
        }

        self.fsm.engine().close();

        if wait {
            self.raft.shutdown().await.map_err(|e| StoreError::Raft {
                reason: e.to_string(),
            })?;
        } else {
            let raft = self.raft.clone();
            tokio::spawn(async move {
                let _ = raft.shutdown().await;
            });
        }
        info!("store closed");
        Ok(())
    }

    fn ensure_leader(&self) -> Result<(), StoreError> {
        let metrics = self.raft.metrics().borrow().clone();
        if metrics.state == ServerState::Leader {
            return Ok(());
        }
        Err(StoreError::NotLeader {
            leader: metrics.current_leader,
        })
    }

    fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    /// Gate on leadership, encode, and propose through consensus with the
    /// configured timeout; surface the apply result to the caller.
    async fn propose(&self, cmd: Command) -> Result<(), StoreError> {
        self.ensure_leader()?;

        let timeout = self.config.apply_timeout;
        let written = match tokio::time::timeout(timeout, self.raft.client_write(cmd)).await {
            Ok(written) => written,
            Err(_) => {
                return Err(StoreError::Timeout {
                    duration_ms: timeout.as_millis() as u64,
                })
            }
        };

        match written {
            Ok(resp) => match resp.data.error {
                None => Ok(()),
                Some(reason) => Err(StoreError::Apply { reason }),
            },
            Err(err) => Err(write_error_to_store(err)),
        }
    }
}

fn write_error_to_store(err: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>) -> StoreError {
    // Leadership lost mid-proposal surfaces like the up-front gate.
    if let Some(forward) = err.forward_to_leader() {
        return StoreError::NotLeader {
            leader: forward.leader_id,
        };
    }
    StoreError::Raft {
        reason: err.to_string(),
    }
}

fn read_peers_json(path: &Path) -> Result<BTreeMap<NodeId, String>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(StoreError::Io { source: err }),
    };
    if bytes.is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_slice(&bytes).map_err(|err| StoreError::Io {
        source: std::io::Error::other(format!("invalid peers.json: {err}")),
    })
}
