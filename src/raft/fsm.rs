//! The deterministic state machine applied to each committed log entry.
//!
//! Owns the engine, the read cache, the session table, and the cluster meta.
//! One mutex serializes mutation with snapshot copies and restores; cache
//! invalidation for a key happens after the engine transaction for that key
//! commits, so a resident cache entry is never newer than the engine.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use snafu::ResultExt;
use tokio::sync::watch;
use tokio::sync::Notify;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cache::Cache;
use crate::config::MAX_BATCH_ROWS;
use crate::engine::Engine;
use crate::error::IoSnafu;
use crate::error::StoreError;
use crate::meta::ClusterMeta;
use crate::session::SessionStore;
use crate::types::Command;
use crate::types::CommandResponse;
use crate::types::Row;

/// State machine core shared by the store facade and the raft storage glue.
pub struct Fsm {
    engine: Engine,
    cache: Cache,
    sessions: SessionStore,
    meta: ClusterMeta,
    /// Serializes apply, snapshot copy, backup, and restore.
    mu: Mutex<()>,
    /// True while a received snapshot is being installed over the engine.
    restoring: AtomicBool,
    /// Signalled when an in-flight snapshot restore finishes.
    ready: Notify,
    /// Carries the reason when the node can no longer serve and must be
    /// restarted (engine reopen failure after a restore).
    fatal: watch::Sender<Option<String>>,
}

impl Fsm {
    pub fn new(engine: Engine, cache: Cache) -> Self {
        let (fatal, _) = watch::channel(None);
        Self {
            engine,
            cache,
            sessions: SessionStore::new(),
            meta: ClusterMeta::new(),
            mu: Mutex::new(()),
            restoring: AtomicBool::new(false),
            ready: Notify::new(),
            fatal,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn meta(&self) -> &ClusterMeta {
        &self.meta
    }

    /// Receiver that observes the fatal-shutdown reason. The host should
    /// stop the node once a reason appears.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal.subscribe()
    }

    /// Apply one committed command. The returned response reaches the
    /// proposing member through its client-write future; other replicas log
    /// failures locally.
    pub fn apply(&self, cmd: &Command) -> CommandResponse {
        let result = match cmd {
            Command::Update { row } => self.apply_row(row),
            Command::Batch { rows } => self.apply_batch(rows),
            Command::CreateBucket { name } => self.apply_create_bucket(name, false),
            Command::CreateBucketIfNotExist { name } => self.apply_create_bucket(name, true),
            Command::RemoveBucket { name } => self.apply_remove_bucket(name),
            Command::RemoveKey { row } => self.apply_row(row),
            Command::SetSession { key, value } => {
                self.sessions.set(key.clone(), value.clone());
                Ok(())
            }
            Command::DelSession { key } => {
                self.sessions.delete(key);
                Ok(())
            }
            Command::SetPeer { peers } => {
                self.meta.merge(peers);
                Ok(())
            }
            Command::Restore { backup_path } => self.apply_restore(Path::new(backup_path)),
        };

        match result {
            Ok(()) => CommandResponse::ok(),
            Err(err) => {
                warn!(kind = cmd.kind(), error = %err, "apply failed");
                CommandResponse::error(err)
            }
        }
    }

    /// Write or delete one row, then drop it from the cache.
    fn apply_row(&self, row: &Row) -> Result<(), StoreError> {
        let _guard = self.mu.lock();
        self.engine.batch_update(std::slice::from_ref(row))?;
        self.cache.remove(&row.bucket, &row.key);
        Ok(())
    }

    fn apply_batch(&self, rows: &[Row]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Err(StoreError::EmptyBatch);
        }
        if rows.len() > MAX_BATCH_ROWS {
            return Err(StoreError::BatchTooLarge {
                size: rows.len(),
                max: MAX_BATCH_ROWS,
            });
        }

        let _guard = self.mu.lock();
        self.engine.batch_update(rows)?;
        for row in rows {
            self.cache.remove(&row.bucket, &row.key);
        }
        Ok(())
    }

    fn apply_create_bucket(&self, name: &[u8], if_not_exist: bool) -> Result<(), StoreError> {
        let _guard = self.mu.lock();
        // Drop any stale entries before the bucket (re)appears.
        self.cache.remove_bucket(name);
        if if_not_exist {
            self.engine.create_bucket_if_not_exist(name)?;
        } else {
            self.engine.create_bucket(name)?;
        }
        Ok(())
    }

    fn apply_remove_bucket(&self, name: &[u8]) -> Result<(), StoreError> {
        let _guard = self.mu.lock();
        self.engine.delete_bucket(name)?;
        self.cache.remove_bucket(name);
        Ok(())
    }

    /// Install a backup file over the database. Replicated, so the file must
    /// be present at the same path on every member.
    fn apply_restore(&self, backup_path: &Path) -> Result<(), StoreError> {
        info!(path = %backup_path.display(), "restoring database from backup file");
        self.install_database(|db_path| std::fs::copy(backup_path, db_path).map(|_| ()))
    }

    /// Read the whole database file. Used by backup and snapshot persist.
    pub fn database_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let _guard = self.mu.lock();
        let staging = tempfile::NamedTempFile::new().context(IoSnafu)?;
        self.engine.copy_file(staging.path())?;
        std::fs::read(staging.path()).context(IoSnafu)
    }

    /// Install snapshot bytes over the database, signalling readiness to
    /// leader-waiters once the restore finishes either way.
    pub fn install_snapshot_bytes(&self, data: &[u8]) -> Result<(), StoreError> {
        self.restoring.store(true, Ordering::Release);
        let result = self.install_database(|db_path| std::fs::write(db_path, data));
        self.restoring.store(false, Ordering::Release);
        self.ready.notify_waiters();
        result
    }

    /// Close the engine, purge the cache, overwrite the database file, and
    /// reopen. A reopen failure leaves the engine closed and raises the
    /// fatal signal: the node must be restarted.
    fn install_database(
        &self,
        overwrite: impl FnOnce(&Path) -> std::io::Result<()>,
    ) -> Result<(), StoreError> {
        let _guard = self.mu.lock();
        self.engine.close();
        self.cache.purge();

        let overwrite_result = overwrite(self.engine.path());
        if let Err(err) = self.engine.reopen() {
            let reason = format!("failed to reopen database after restore: {err}");
            error!(error = %err, "database reopen after restore failed; node must be restarted");
            let _ = self.fatal.send(Some(reason));
            return Err(err.into());
        }

        overwrite_result.context(IoSnafu)
    }

    /// Wait until no snapshot restore is in flight, up to `timeout`.
    /// Returns false on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            if !self.restoring.load(Ordering::Acquire) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return false;
            }
        }
    }
}
