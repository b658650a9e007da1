//! Consensus plumbing: the state machine, log storage, snapshot repository,
//! and the RPC transport between members.

pub mod fsm;
pub mod network;
pub mod server;
pub mod snapshot;
pub mod storage;

pub use fsm::Fsm;
pub use network::Network;
pub use server::RaftServer;
pub use snapshot::SnapshotRepo;
pub use storage::RaftStore;
