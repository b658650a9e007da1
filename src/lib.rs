//! Replicated configuration-and-resource registry core.
//!
//! A strongly consistent, bucketed key-value store: clients read and write
//! through any cluster member, writes are ordered through Raft consensus,
//! and every replica applies the same sequence of mutations to its local
//! embedded database. A byte-budgeted LRU cache fronts reads and is kept
//! coherent with applied mutations; an ephemeral session table is
//! replicated through the same log so session reads are deterministic on
//! any member.
//!
//! The [`Store`] facade is the whole public surface: higher layers treat it
//! as a typed blob database and never touch consensus directly.

/// Byte-budgeted, bucket-aware LRU read cache.
pub mod cache;
/// Configuration and deployment defaults.
pub mod config;
/// Embedded bucketed key-value engine.
pub mod engine;
/// Error taxonomy for engine and store operations.
pub mod error;
/// Replicated cluster metadata (API peer addresses).
pub mod meta;
/// Consensus plumbing: state machine, log storage, snapshots, transport.
pub mod raft;
/// Replicated ephemeral session table.
pub mod session;
/// The public store facade.
pub mod store;
/// Rows, commands, and the raft type configuration.
pub mod types;

pub use cache::Cache;
pub use config::StoreConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use error::StoreError;
pub use store::Store;
pub use types::ClusterState;
pub use types::Command;
pub use types::NodeId;
pub use types::Row;
