//! Error types for engine and store operations.

use snafu::Snafu;

use crate::types::NodeId;

/// Errors from the embedded key-value engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// Failed to open the database file.
    #[snafu(display("failed to open database at {path}: {source}"))]
    OpenDatabase {
        path: String,
        #[snafu(source(from(redb::DatabaseError, Box::new)))]
        source: Box<redb::DatabaseError>,
    },

    /// Failed to begin a read transaction.
    #[snafu(display("failed to begin read transaction: {source}"))]
    BeginRead {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
    },

    /// Failed to begin a write transaction.
    #[snafu(display("failed to begin write transaction: {source}"))]
    BeginWrite {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
    },

    /// Failed to open a table.
    #[snafu(display("failed to open table: {source}"))]
    OpenTable {
        #[snafu(source(from(redb::TableError, Box::new)))]
        source: Box<redb::TableError>,
    },

    /// Failed to commit a transaction.
    #[snafu(display("failed to commit transaction: {source}"))]
    Commit {
        #[snafu(source(from(redb::CommitError, Box::new)))]
        source: Box<redb::CommitError>,
    },

    /// Failed to read a value.
    #[snafu(display("failed to get from table: {source}"))]
    Get {
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    /// Failed to write a value.
    #[snafu(display("failed to insert into table: {source}"))]
    Insert {
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    /// Failed to remove a value.
    #[snafu(display("failed to remove from table: {source}"))]
    Remove {
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    /// Failed to iterate a key range.
    #[snafu(display("failed to iterate table range: {source}"))]
    Range {
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    /// The addressed bucket does not exist.
    #[snafu(display("bucket not found: {bucket}"))]
    BucketNotFound { bucket: String },

    /// Bucket creation hit an existing bucket.
    #[snafu(display("bucket already exists: {bucket}"))]
    BucketExists { bucket: String },

    /// The engine was closed (mid-restore or after shutdown).
    #[snafu(display("engine is closed"))]
    Closed,

    /// Failed to copy the database file.
    #[snafu(display("failed to copy database file to {path}: {source}"))]
    CopyFile {
        path: String,
        source: std::io::Error,
    },
}

/// Errors surfaced by the public store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// The local node is not the leader; writes must be retried against the
    /// current leader.
    #[snafu(display("not leader; current leader: {leader:?}"))]
    NotLeader { leader: Option<NodeId> },

    /// The addressed bucket does not exist.
    // Selector suffix keeps it distinct from the engine-level selector.
    #[snafu(context(suffix(CtxSnafu)), display("bucket not found: {bucket}"))]
    BucketNotFound { bucket: String },

    /// A command failed structural validation.
    #[snafu(display("invalid command: {reason}"))]
    InvalidCommand { reason: String },

    /// A batch proposal carried no rows.
    #[snafu(display("no rows in batch"))]
    EmptyBatch,

    /// A batch proposal exceeded the row bound.
    #[snafu(display("batch of {size} rows exceeds maximum of {max}"))]
    BatchTooLarge { size: usize, max: usize },

    /// The proposal did not commit within the configured timeout.
    #[snafu(display("proposal timed out after {duration_ms}ms"))]
    Timeout { duration_ms: u64 },

    /// An engine failure outside the distinguished kinds.
    #[snafu(display("storage error: {source}"))]
    Engine { source: EngineError },

    /// The apply on the proposing member reported an error.
    #[snafu(display("apply failed: {reason}"))]
    Apply { reason: String },

    /// A consensus-layer failure outside the distinguished kinds.
    #[snafu(display("raft error: {reason}"))]
    Raft { reason: String },

    /// No leader appeared within the wait bound.
    #[snafu(display("wait for leader timed out after {duration_ms}ms"))]
    WaitForLeaderTimeout { duration_ms: u64 },

    /// A snapshot restore did not finish within the wait bound.
    #[snafu(display("wait for snapshot restore timed out after {duration_ms}ms"))]
    SnapshotWaitTimeout { duration_ms: u64 },

    /// Filesystem failure around backup staging or directory creation.
    #[snafu(display("io error: {source}"))]
    Io { source: std::io::Error },
}

impl From<EngineError> for StoreError {
    fn from(err: EngineError) -> Self {
        // BucketNotFound stays a distinguished kind across the boundary.
        match err {
            EngineError::BucketNotFound { bucket } => StoreError::BucketNotFound { bucket },
            other => StoreError::Engine { source: other },
        }
    }
}
