//! Raft log storage and state-machine glue.
//!
//! One struct backs both halves of consensus storage: the replicated log and
//! vote live in their own redb file (`raft/raft.db`), entirely separate from
//! the engine's database file, and applied entries are dispatched to the
//! [`Fsm`]. Snapshots serialize the whole engine file through the
//! [`SnapshotRepo`].

use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use openraft::storage::LogState;
use openraft::storage::RaftLogReader;
use openraft::storage::RaftSnapshotBuilder;
use openraft::storage::Snapshot;
use openraft::BasicNode;
use openraft::Entry;
use openraft::EntryPayload;
use openraft::ErrorSubject;
use openraft::ErrorVerb;
use openraft::LogId;
use openraft::OptionalSend;
#[allow(deprecated)]
use openraft::RaftStorage;
use openraft::SnapshotMeta;
use openraft::StorageError;
use openraft::StoredMembership;
use openraft::Vote;
use redb::Database;
use redb::ReadableTable;
use redb::TableDefinition;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;

use crate::error::BeginWriteSnafu;
use crate::error::CommitSnafu;
use crate::error::EngineError;
use crate::error::OpenDatabaseSnafu;
use crate::error::OpenTableSnafu;
use crate::raft::fsm::Fsm;
use crate::raft::snapshot::SnapshotRepo;
use crate::types::CommandResponse;
use crate::types::NodeId;
use crate::types::TypeConfig;

const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_meta");

const KEY_VOTE: &str = "vote";
const KEY_LAST_PURGED: &str = "last_purged";
const KEY_LAST_APPLIED: &str = "last_applied";
const KEY_MEMBERSHIP: &str = "membership";

/// Consensus storage backend: log + stable store + state machine dispatch.
#[derive(Clone)]
pub struct RaftStore {
    db: Arc<Database>,
    fsm: Arc<Fsm>,
    snapshots: Arc<SnapshotRepo>,
}

impl RaftStore {
    /// Open the log database at `path` and bind it to the state machine.
    pub fn open(
        path: &Path,
        fsm: Arc<Fsm>,
        snapshots: Arc<SnapshotRepo>,
    ) -> Result<Self, EngineError> {
        let db = Database::create(path).context(OpenDatabaseSnafu {
            path: path.display().to_string(),
        })?;
        let txn = db.begin_write().context(BeginWriteSnafu)?;
        {
            txn.open_table(LOG_TABLE).context(OpenTableSnafu)?;
            txn.open_table(META_TABLE).context(OpenTableSnafu)?;
        }
        txn.commit().context(CommitSnafu)?;
        Ok(Self {
            db: Arc::new(db),
            fsm,
            snapshots,
        })
    }

    fn read_meta<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError<NodeId>> {
        let txn = self.db.begin_read().map_err(|e| store_read_err(&e))?;
        let table = txn.open_table(META_TABLE).map_err(|e| store_read_err(&e))?;
        match table.get(key).map_err(|e| store_read_err(&e))? {
            Some(value) => {
                let decoded = bincode::deserialize(value.value()).map_err(|e| store_read_err(&e))?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    fn write_meta<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError<NodeId>> {
        let bytes = bincode::serialize(value).map_err(|e| store_write_err(&e))?;
        let txn = self.db.begin_write().map_err(|e| store_write_err(&e))?;
        {
            let mut table = txn.open_table(META_TABLE).map_err(|e| store_write_err(&e))?;
            table.insert(key, bytes.as_slice()).map_err(|e| store_write_err(&e))?;
        }
        txn.commit().map_err(|e| store_write_err(&e))
    }

    fn last_log_entry(&self) -> Result<Option<Entry<TypeConfig>>, StorageError<NodeId>> {
        let txn = self.db.begin_read().map_err(|e| read_logs_err(&e))?;
        let table = txn.open_table(LOG_TABLE).map_err(|e| read_logs_err(&e))?;
        let result = match table.last().map_err(|e| read_logs_err(&e))? {
            Some((_, value)) => {
                let entry = bincode::deserialize(value.value()).map_err(|e| read_logs_err(&e))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        };
        result
    }

    /// Delete log entries in `range`, collected first so the removal runs in
    /// a single write transaction.
    fn delete_log_range(
        &self,
        range: impl RangeBounds<u64>,
    ) -> Result<(), StorageError<NodeId>> {
        let doomed: Vec<u64> = {
            let txn = self.db.begin_read().map_err(|e| read_logs_err(&e))?;
            let table = txn.open_table(LOG_TABLE).map_err(|e| read_logs_err(&e))?;
            let mut keys = Vec::new();
            for item in table.range(range).map_err(|e| read_logs_err(&e))? {
                let (key, _) = item.map_err(|e| read_logs_err(&e))?;
                keys.push(key.value());
            }
            keys
        };

        let txn = self.db.begin_write().map_err(|e| write_logs_err(&e))?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(|e| write_logs_err(&e))?;
            for key in doomed {
                table.remove(key).map_err(|e| write_logs_err(&e))?;
            }
        }
        txn.commit().map_err(|e| write_logs_err(&e))
    }
}

impl RaftLogReader<TypeConfig> for RaftStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let txn = self.db.begin_read().map_err(|e| read_logs_err(&e))?;
        let table = txn.open_table(LOG_TABLE).map_err(|e| read_logs_err(&e))?;

        let mut entries = Vec::new();
        for item in table.range(range).map_err(|e| read_logs_err(&e))? {
            let (_, value) = item.map_err(|e| read_logs_err(&e))?;
            let entry: Entry<TypeConfig> =
                bincode::deserialize(value.value()).map_err(|e| read_logs_err(&e))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Builds a snapshot by copying the engine's database file.
pub struct RegistrySnapshotBuilder {
    store: RaftStore,
}

impl RaftSnapshotBuilder<TypeConfig> for RegistrySnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let data = self
            .store
            .fsm
            .database_bytes()
            .map_err(|e| snapshot_err(&e))?;

        let last_applied: Option<LogId<NodeId>> = self.store.read_meta(KEY_LAST_APPLIED)?;
        let membership: StoredMembership<NodeId, BasicNode> =
            self.store.read_meta(KEY_MEMBERSHIP)?.unwrap_or_default();

        let snapshot_id = match &last_applied {
            Some(log_id) => format!("{}-{}-{}", log_id.leader_id.get_term(), log_id.index, unix_ms()),
            None => format!("0-0-{}", unix_ms()),
        };
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };

        self.store
            .snapshots
            .save(&meta, &data)
            .map_err(|e| snapshot_err(&e))?;

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_id = ?meta.last_log_id,
            size = data.len(),
            "snapshot built"
        );
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

#[allow(deprecated)]
impl RaftStorage<TypeConfig> for RaftStore {
    type LogReader = Self;
    type SnapshotBuilder = RegistrySnapshotBuilder;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged: Option<LogId<NodeId>> = self.read_meta(KEY_LAST_PURGED)?;
        let last_log_id = match self.last_log_entry()? {
            Some(entry) => Some(entry.log_id),
            None => last_purged,
        };
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.write_meta(KEY_VOTE, vote)
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.read_meta(KEY_VOTE)
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let txn = self.db.begin_write().map_err(|e| write_logs_err(&e))?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(|e| write_logs_err(&e))?;
            for entry in entries {
                let bytes = bincode::serialize(&entry).map_err(|e| write_logs_err(&e))?;
                table
                    .insert(entry.log_id.index, bytes.as_slice())
                    .map_err(|e| write_logs_err(&e))?;
            }
        }
        txn.commit().map_err(|e| write_logs_err(&e))
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        debug!(since = log_id.index, "deleting conflicting log entries");
        self.delete_log_range(log_id.index..)
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        debug!(upto = log_id.index, "purging log entries");
        self.delete_log_range(..=log_id.index)?;
        self.write_meta(KEY_LAST_PURGED, &log_id)
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let last_applied = self.read_meta(KEY_LAST_APPLIED)?;
        let membership = self.read_meta(KEY_MEMBERSHIP)?.unwrap_or_default();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<CommandResponse>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());
        let mut membership: Option<StoredMembership<NodeId, BasicNode>> = None;

        for entry in entries {
            let response = match &entry.payload {
                EntryPayload::Blank => CommandResponse::ok(),
                EntryPayload::Normal(cmd) => {
                    debug!(index = entry.log_id.index, kind = cmd.kind(), "applying command");
                    self.fsm.apply(cmd)
                }
                EntryPayload::Membership(m) => {
                    membership = Some(StoredMembership::new(Some(entry.log_id), m.clone()));
                    CommandResponse::ok()
                }
            };
            responses.push(response);
        }

        if let Some(last) = entries.last() {
            self.write_meta(KEY_LAST_APPLIED, &last.log_id)?;
        }
        if let Some(m) = membership {
            self.write_meta(KEY_MEMBERSHIP, &m)?;
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        RegistrySnapshotBuilder { store: self.clone() }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_id = ?meta.last_log_id,
            size = data.len(),
            "installing snapshot"
        );

        self.fsm
            .install_snapshot_bytes(&data)
            .map_err(|e| snapshot_err(&e))?;
        self.snapshots
            .save(meta, &data)
            .map_err(|e| snapshot_err(&e))?;

        if let Some(log_id) = meta.last_log_id {
            self.write_meta(KEY_LAST_APPLIED, &log_id)?;
        }
        self.write_meta(KEY_MEMBERSHIP, &meta.last_membership)
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        match self.snapshots.latest().map_err(|e| snapshot_err(&e))? {
            Some((meta, data)) => Ok(Some(Snapshot {
                meta,
                snapshot: Box::new(Cursor::new(data)),
            })),
            None => Ok(None),
        }
    }
}

fn unix_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn store_read_err<E: std::error::Error>(e: &E) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

fn store_write_err<E: std::error::Error>(e: &E) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

fn read_logs_err<E: std::error::Error>(e: &E) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Logs,
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

fn write_logs_err<E: std::error::Error>(e: &E) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Logs,
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

fn snapshot_err<E: std::error::Error>(e: &E) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Snapshot(None),
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

#[cfg(test)]
#[allow(deprecated)]
mod tests {
    use openraft::CommittedLeaderId;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::Cache;
    use crate::engine::Engine;
    use crate::types::Command;
    use crate::types::Row;

    fn open_store(dir: &TempDir) -> RaftStore {
        let engine = Engine::open(dir.path().join("registry.db")).unwrap();
        let fsm = Arc::new(Fsm::new(engine, Cache::new(0, None)));
        let snapshots = Arc::new(SnapshotRepo::open(dir.path().join("snapshots"), 2).unwrap());
        RaftStore::open(&dir.path().join("raft.db"), fsm, snapshots).unwrap()
    }

    fn log_id(term: u64, index: u64) -> LogId<NodeId> {
        LogId::new(CommittedLeaderId::new(term, 1), index)
    }

    fn entry(term: u64, index: u64, cmd: Command) -> Entry<TypeConfig> {
        Entry {
            log_id: log_id(term, index),
            payload: EntryPayload::Normal(cmd),
        }
    }

    #[tokio::test]
    async fn append_then_read_back() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store
            .append_to_log(vec![
                entry(1, 1, Command::CreateBucket { name: b"ns".to_vec() }),
                entry(1, 2, Command::Update { row: Row::put("ns", "k", "v") }),
            ])
            .await
            .unwrap();

        let entries = store.try_get_log_entries(1..3).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].log_id.index, 1);
        assert_eq!(entries[1].log_id.index, 2);

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 2);
        assert!(state.last_purged_log_id.is_none());
    }

    #[tokio::test]
    async fn vote_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        assert!(store.read_vote().await.unwrap().is_none());
        let vote = Vote::new(3, 1);
        store.save_vote(&vote).await.unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn conflicts_are_truncated_and_purges_advance_the_floor() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let entries: Vec<_> = (1..=5)
            .map(|i| entry(1, i, Command::CreateBucketIfNotExist { name: b"ns".to_vec() }))
            .collect();
        store.append_to_log(entries).await.unwrap();

        store.delete_conflict_logs_since(log_id(1, 4)).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 3);

        store.purge_logs_upto(log_id(1, 2)).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.unwrap().index, 2);
        assert_eq!(state.last_log_id.unwrap().index, 3);

        let remaining = store.try_get_log_entries(0..10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].log_id.index, 3);
    }

    #[tokio::test]
    async fn apply_mutates_engine_and_tracks_applied_state() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let responses = store
            .apply_to_state_machine(&[
                entry(1, 1, Command::CreateBucket { name: b"ns".to_vec() }),
                entry(1, 2, Command::Update { row: Row::put("ns", "k", "v") }),
            ])
            .await
            .unwrap();
        assert!(responses.iter().all(|r| r.error.is_none()));

        let engine_value = store.fsm.engine().view(b"ns", b"k").unwrap();
        assert_eq!(engine_value.as_deref(), Some(&b"v"[..]));

        let (last_applied, _) = store.last_applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 2);
    }

    #[tokio::test]
    async fn apply_error_reaches_the_response_not_the_result() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let responses = store
            .apply_to_state_machine(&[entry(1, 1, Command::Update {
                row: Row::put("ghost", "k", "v"),
            })])
            .await
            .unwrap();
        assert!(responses[0].error.as_deref().unwrap().contains("bucket not found"));
    }

    #[tokio::test]
    async fn snapshot_build_and_install_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store
            .apply_to_state_machine(&[
                entry(1, 1, Command::CreateBucket { name: b"ns".to_vec() }),
                entry(1, 2, Command::Update { row: Row::put("ns", "k1", "v1") }),
            ])
            .await
            .unwrap();

        let snapshot = store.get_snapshot_builder().await.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id.unwrap().index, 2);

        // Diverge, then install the snapshot back over the divergence.
        store
            .apply_to_state_machine(&[entry(1, 3, Command::Update {
                row: Row::put("ns", "k1", "v2"),
            })])
            .await
            .unwrap();

        let meta = snapshot.meta.clone();
        store.install_snapshot(&meta, snapshot.snapshot).await.unwrap();

        let value = store.fsm.engine().view(b"ns", b"k1").unwrap();
        assert_eq!(value.as_deref(), Some(&b"v1"[..]));

        let current = store.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.snapshot_id, meta.snapshot_id);
    }
}
