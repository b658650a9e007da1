//! Replication types: rows, commands, and the Raft type configuration.
//!
//! Every mutation of the store travels through the log as a [`Command`], an
//! explicit sum type over the mutation kinds. Each variant carries only the
//! fields it needs, so malformed shapes (wrong row arity, missing names) are
//! unrepresentable rather than checked at apply time. New kinds extend the
//! enum; the codec carries no version field.

use std::collections::BTreeMap;
use std::io::Cursor;

use serde::Deserialize;
use serde::Serialize;

/// Raft node identifier.
pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Raft type configuration for the registry store.
    pub TypeConfig:
        D = Command,
        R = CommandResponse,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// One replication unit: a keyed value inside a bucket.
///
/// An absent `value` means the key is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl Row {
    /// Row that sets `key` to `value` within `bucket`.
    pub fn put(bucket: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Row that deletes `key` within `bucket`.
    pub fn delete(bucket: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            value: None,
        }
    }
}

/// A mutation written to the consensus log and applied by every replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Write a single row.
    Update { row: Row },
    /// Write a batch of rows under one engine transaction.
    Batch { rows: Vec<Row> },
    /// Create a bucket; fails if it already exists.
    CreateBucket { name: Vec<u8> },
    /// Create a bucket; idempotent.
    CreateBucketIfNotExist { name: Vec<u8> },
    /// Remove a bucket and everything under it.
    RemoveBucket { name: Vec<u8> },
    /// Delete a single key.
    RemoveKey { row: Row },
    /// Set a session token.
    SetSession { key: String, value: String },
    /// Delete a session token.
    DelSession { key: String },
    /// Merge raft-address -> API-address pairs into the cluster meta.
    SetPeer { peers: BTreeMap<String, String> },
    /// Install a backup file over the local database.
    Restore { backup_path: String },
}

impl Command {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Update { .. } => "update",
            Command::Batch { .. } => "batch",
            Command::CreateBucket { .. } => "create-bucket",
            Command::CreateBucketIfNotExist { .. } => "create-bucket-if-not-exist",
            Command::RemoveBucket { .. } => "remove-bucket",
            Command::RemoveKey { .. } => "remove-key",
            Command::SetSession { .. } => "set-session",
            Command::DelSession { .. } => "del-session",
            Command::SetPeer { .. } => "set-peer",
            Command::Restore { .. } => "restore",
        }
    }
}

/// Response attached to an applied log entry.
///
/// The proposing member receives it through the client-write future; the only
/// payload is the apply error, if any. Replicas that did not propose the
/// command log the error locally instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub error: Option<String>,
}

impl CommandResponse {
    /// Successful apply.
    pub fn ok() -> Self {
        Self { error: None }
    }

    /// Failed apply, carrying the error text.
    pub fn error(err: impl std::fmt::Display) -> Self {
        Self {
            error: Some(err.to_string()),
        }
    }
}

/// Raft role of the local node, as seen by callers of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    Leader,
    Follower,
    Candidate,
    Shutdown,
    Unknown,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterState::Leader => "leader",
            ClusterState::Follower => "follower",
            ClusterState::Candidate => "candidate",
            ClusterState::Shutdown => "shutdown",
            ClusterState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
