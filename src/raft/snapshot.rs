//! File snapshot repository.
//!
//! Each snapshot is a pair of files under `raft/snapshots/`: `<id>.db` holds
//! the raw database bytes and `<id>.meta` the bincode-encoded snapshot
//! metadata. Ids are `term-index-millis`, so ordering is numeric on the
//! parsed triple, never lexical. Only the newest `retain` snapshots are kept.

use std::io;
use std::path::PathBuf;

use openraft::BasicNode;
use openraft::SnapshotMeta;
use tracing::debug;
use tracing::warn;

use crate::types::NodeId;

type Meta = SnapshotMeta<NodeId, BasicNode>;

/// On-disk snapshot store retaining the newest N snapshots.
pub struct SnapshotRepo {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotRepo {
    /// Open the repository at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>, retain: usize) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    /// Persist a snapshot and prune older ones past the retention bound.
    pub fn save(&self, meta: &Meta, data: &[u8]) -> io::Result<()> {
        let meta_bytes = bincode::serialize(meta).map_err(io::Error::other)?;

        // Data first, staged through a rename, so a readable meta file
        // always refers to complete data.
        let data_path = self.dir.join(format!("{}.db", meta.snapshot_id));
        let staging = self.dir.join(format!("{}.db.tmp", meta.snapshot_id));
        std::fs::write(&staging, data)?;
        std::fs::rename(&staging, &data_path)?;
        std::fs::write(self.dir.join(format!("{}.meta", meta.snapshot_id)), meta_bytes)?;

        debug!(snapshot_id = %meta.snapshot_id, size = data.len(), "snapshot persisted");
        self.prune()
    }

    /// The newest snapshot, if any.
    pub fn latest(&self) -> io::Result<Option<(Meta, Vec<u8>)>> {
        let mut ids = self.sorted_ids()?;
        while let Some((_, id)) = ids.pop() {
            let meta_bytes = match std::fs::read(self.dir.join(format!("{id}.meta"))) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(snapshot_id = %id, error = %err, "skipping snapshot with unreadable meta");
                    continue;
                }
            };
            let meta: Meta = match bincode::deserialize(&meta_bytes) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(snapshot_id = %id, error = %err, "skipping snapshot with undecodable meta");
                    continue;
                }
            };
            let data = match std::fs::read(self.dir.join(format!("{id}.db"))) {
                Ok(data) => data,
                Err(err) => {
                    warn!(snapshot_id = %id, error = %err, "skipping snapshot with unreadable data");
                    continue;
                }
            };
            return Ok(Some((meta, data)));
        }
        Ok(None)
    }

    /// Snapshot ids sorted oldest first by the (term, index, millis) triple.
    fn sorted_ids(&self) -> io::Result<Vec<((u64, u64, u64), String)>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(id) = name.strip_suffix(".meta") else {
                continue;
            };
            match parse_snapshot_id(id) {
                Some(key) => ids.push((key, id.to_string())),
                None => warn!(snapshot_id = %id, "ignoring snapshot with unparsable id"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn prune(&self) -> io::Result<()> {
        let ids = self.sorted_ids()?;
        if ids.len() <= self.retain {
            return Ok(());
        }
        let doomed = ids.len() - self.retain;
        for (_, id) in ids.into_iter().take(doomed) {
            debug!(snapshot_id = %id, "pruning snapshot");
            let _ = std::fs::remove_file(self.dir.join(format!("{id}.meta")));
            let _ = std::fs::remove_file(self.dir.join(format!("{id}.db")));
        }
        Ok(())
    }
}

fn parse_snapshot_id(id: &str) -> Option<(u64, u64, u64)> {
    let mut parts = id.splitn(3, '-');
    let term = parts.next()?.parse().ok()?;
    let index = parts.next()?.parse().ok()?;
    let millis = parts.next()?.parse().ok()?;
    Some((term, index, millis))
}
