//! Bucketed key-value engine over a single redb database file.
//!
//! The persistent namespace is a two-level map: bucket -> key -> value, all
//! opaque byte strings. Buckets are tracked in a membership table so reads
//! and writes against a missing bucket yield the distinguished
//! [`EngineError::BucketNotFound`]; the data itself lives in one table keyed
//! by the `(bucket, key)` composite, which keeps prefix scans and bucket
//! drops a single contiguous range.
//!
//! The engine is single-writer, many-reader: redb serializes write
//! transactions and gives readers MVCC views. The database handle can be
//! closed and reopened in place, which the restore path uses to install a
//! backup file over the live database.

use std::path::Path;
use std::path::PathBuf;

use parking_lot::RwLock;
use redb::Database;
use redb::ReadableTable;
use redb::TableDefinition;
use snafu::ResultExt;

use crate::error::BeginReadSnafu;
use crate::error::BeginWriteSnafu;
use crate::error::BucketExistsSnafu;
use crate::error::BucketNotFoundSnafu;
use crate::error::ClosedSnafu;
use crate::error::CommitSnafu;
use crate::error::CopyFileSnafu;
use crate::error::EngineError;
use crate::error::GetSnafu;
use crate::error::InsertSnafu;
use crate::error::OpenDatabaseSnafu;
use crate::error::OpenTableSnafu;
use crate::error::RangeSnafu;
use crate::error::RemoveSnafu;
use crate::types::Row;

const DATA_TABLE: TableDefinition<(&[u8], &[u8]), &[u8]> = TableDefinition::new("data");
const BUCKETS_TABLE: TableDefinition<&[u8], ()> = TableDefinition::new("buckets");

/// Embedded bucketed key-value store.
pub struct Engine {
    path: PathBuf,
    db: RwLock<Option<Database>>,
}

impl Engine {
    /// Open (or create) the database at `path` and ensure its tables exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        let db = open_database(&path)?;
        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the value for `key` in `bucket` under a read-only transaction.
    ///
    /// Returns `Ok(None)` when the bucket exists but the key does not.
    pub fn view(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| ClosedSnafu.build())?;
        let txn = db.begin_read().context(BeginReadSnafu)?;

        let buckets = txn.open_table(BUCKETS_TABLE).context(OpenTableSnafu)?;
        if buckets.get(bucket).context(GetSnafu)?.is_none() {
            return BucketNotFoundSnafu {
                bucket: String::from_utf8_lossy(bucket),
            }
            .fail();
        }

        let data = txn.open_table(DATA_TABLE).context(OpenTableSnafu)?;
        let value = data
            .get((bucket, key))
            .context(GetSnafu)?
            .map(|v| v.value().to_vec());
        Ok(value)
    }

    /// Set `key` to `value` in `bucket` under a read-write transaction.
    pub fn update(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.apply_rows(std::slice::from_ref(&Row {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            value: Some(value.to_vec()),
        }))
    }

    /// Delete `key` in `bucket` under a read-write transaction.
    pub fn delete(&self, bucket: &[u8], key: &[u8]) -> Result<(), EngineError> {
        self.apply_rows(std::slice::from_ref(&Row {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            value: None,
        }))
    }

    /// Apply every row under one transaction: present values are written,
    /// absent values delete their key. Nothing is committed on error.
    pub fn batch_update(&self, rows: &[Row]) -> Result<(), EngineError> {
        self.apply_rows(rows)
    }

    fn apply_rows(&self, rows: &[Row]) -> Result<(), EngineError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| ClosedSnafu.build())?;
        let txn = db.begin_write().context(BeginWriteSnafu)?;
        {
            let buckets = txn.open_table(BUCKETS_TABLE).context(OpenTableSnafu)?;
            let mut data = txn.open_table(DATA_TABLE).context(OpenTableSnafu)?;
            for row in rows {
                if buckets.get(row.bucket.as_slice()).context(GetSnafu)?.is_none() {
                    return BucketNotFoundSnafu {
                        bucket: String::from_utf8_lossy(&row.bucket),
                    }
                    .fail();
                }
                match &row.value {
                    Some(value) => {
                        data.insert((row.bucket.as_slice(), row.key.as_slice()), value.as_slice())
                            .context(InsertSnafu)?;
                    }
                    None => {
                        data.remove((row.bucket.as_slice(), row.key.as_slice()))
                            .context(RemoveSnafu)?;
                    }
                }
            }
        }
        txn.commit().context(CommitSnafu)
    }

    /// Create `bucket`; fails with [`EngineError::BucketExists`] if present.
    pub fn create_bucket(&self, bucket: &[u8]) -> Result<(), EngineError> {
        self.create_bucket_inner(bucket, true)
    }

    /// Create `bucket` if it does not already exist.
    pub fn create_bucket_if_not_exist(&self, bucket: &[u8]) -> Result<(), EngineError> {
        self.create_bucket_inner(bucket, false)
    }

    fn create_bucket_inner(&self, bucket: &[u8], must_not_exist: bool) -> Result<(), EngineError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| ClosedSnafu.build())?;
        let txn = db.begin_write().context(BeginWriteSnafu)?;
        {
            let mut buckets = txn.open_table(BUCKETS_TABLE).context(OpenTableSnafu)?;
            let existed = buckets.insert(bucket, ()).context(InsertSnafu)?.is_some();
            if existed && must_not_exist {
                return BucketExistsSnafu {
                    bucket: String::from_utf8_lossy(bucket),
                }
                .fail();
            }
        }
        txn.commit().context(CommitSnafu)
    }

    /// Remove `bucket` and every key under it.
    pub fn delete_bucket(&self, bucket: &[u8]) -> Result<(), EngineError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| ClosedSnafu.build())?;
        let txn = db.begin_write().context(BeginWriteSnafu)?;
        {
            let mut buckets = txn.open_table(BUCKETS_TABLE).context(OpenTableSnafu)?;
            if buckets.remove(bucket).context(RemoveSnafu)?.is_none() {
                return BucketNotFoundSnafu {
                    bucket: String::from_utf8_lossy(bucket),
                }
                .fail();
            }

            let mut data = txn.open_table(DATA_TABLE).context(OpenTableSnafu)?;
            let start: (&[u8], &[u8]) = (bucket, b"");
            let doomed: Vec<Vec<u8>> = {
                let mut keys = Vec::new();
                for item in data.range(start..).context(RangeSnafu)? {
                    let (key_guard, _) = item.context(GetSnafu)?;
                    let (b, k) = key_guard.value();
                    if b != bucket {
                        break;
                    }
                    keys.push(k.to_vec());
                }
                keys
            };
            for key in doomed {
                data.remove((bucket, key.as_slice())).context(RemoveSnafu)?;
            }
        }
        txn.commit().context(CommitSnafu)
    }

    /// Collect every `(key, value)` in `bucket` whose key starts with
    /// `prefix`, in key order, skipping empty values. An empty prefix
    /// returns the whole bucket. Runs under a read-only transaction.
    pub fn prefix_scan(&self, bucket: &[u8], prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| ClosedSnafu.build())?;
        let txn = db.begin_read().context(BeginReadSnafu)?;

        let buckets = txn.open_table(BUCKETS_TABLE).context(OpenTableSnafu)?;
        if buckets.get(bucket).context(GetSnafu)?.is_none() {
            return BucketNotFoundSnafu {
                bucket: String::from_utf8_lossy(bucket),
            }
            .fail();
        }

        let data = txn.open_table(DATA_TABLE).context(OpenTableSnafu)?;
        let mut result = Vec::new();
        for item in data.range((bucket, prefix)..).context(RangeSnafu)? {
            let (key_guard, value_guard) = item.context(GetSnafu)?;
            let (b, k) = key_guard.value();
            // Keys sharing the prefix are contiguous from the seek point.
            if b != bucket || !k.starts_with(prefix) {
                break;
            }
            let value = value_guard.value();
            if !value.is_empty() {
                result.push((k.to_vec(), value.to_vec()));
            }
        }
        Ok(result)
    }

    /// Copy the database file to `dst`.
    ///
    /// The caller must hold the store mutex so no write transaction commits
    /// mid-copy; redb leaves the file consistent between commits.
    pub fn copy_file(&self, dst: &Path) -> Result<u64, EngineError> {
        let guard = self.db.read();
        if guard.is_none() {
            return ClosedSnafu.fail();
        }
        std::fs::copy(&self.path, dst).context(CopyFileSnafu {
            path: dst.display().to_string(),
        })
    }

    /// Close the database handle, releasing the file lock. Subsequent
    /// operations fail with [`EngineError::Closed`] until [`Engine::reopen`].
    pub fn close(&self) {
        *self.db.write() = None;
    }

    /// Reopen the database file in place after [`Engine::close`].
    pub fn reopen(&self) -> Result<(), EngineError> {
        let mut guard = self.db.write();
        let db = open_database(&self.path)?;
        *guard = Some(db);
        Ok(())
    }
}

fn open_database(path: &Path) -> Result<Database, EngineError> {
    let db = Database::create(path).context(OpenDatabaseSnafu {
        path: path.display().to_string(),
    })?;
    // Pre-create the tables so read transactions never race their existence.
    let txn = db.begin_write().context(BeginWriteSnafu)?;
    {
        txn.open_table(DATA_TABLE).context(OpenTableSnafu)?;
        txn.open_table(BUCKETS_TABLE).context(OpenTableSnafu)?;
    }
    txn.commit().context(CommitSnafu)?;
    Ok(db)
}
