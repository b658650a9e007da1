//! Raft RPC client: per-peer connections over TCP.
//!
//! Frames are a 4-byte big-endian length followed by a bincode payload, the
//! same framing the server side speaks. Each peer gets one lazily-dialed
//! connection that is dropped and re-dialed on the next RPC after any
//! transport failure.

use openraft::error::InstallSnapshotError;
use openraft::error::NetworkError;
use openraft::error::RPCError;
use openraft::error::RaftError;
use openraft::error::RemoteError;
use openraft::error::Unreachable;
use openraft::network::RPCOption;
use openraft::network::RaftNetwork;
use openraft::network::RaftNetworkFactory;
use openraft::raft::AppendEntriesRequest;
use openraft::raft::AppendEntriesResponse;
use openraft::raft::InstallSnapshotRequest;
use openraft::raft::InstallSnapshotResponse;
use openraft::raft::VoteRequest;
use openraft::raft::VoteResponse;
use openraft::BasicNode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::types::NodeId;
use crate::types::TypeConfig;

/// Upper bound on a single RPC frame; snapshot chunks dominate sizing.
pub(crate) const MAX_RPC_MESSAGE_SIZE: u32 = 32 * 1024 * 1024;

/// Requests a member sends to a peer's raft core.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum RaftRpcRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
}

/// Replies carrying the remote raft core's result verbatim.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum RaftRpcReply {
    AppendEntries(Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>),
    InstallSnapshot(
        Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>,
    ),
    Vote(Result<VoteResponse<NodeId>, RaftError<NodeId>>),
}

/// Transport-level failures below the raft protocol.
#[derive(Debug, Snafu)]
pub(crate) enum TransportError {
    #[snafu(display("failed to connect to {addr}: {source}"))]
    Connect { addr: String, source: std::io::Error },

    #[snafu(display("rpc io failure: {source}"))]
    FrameIo { source: std::io::Error },

    #[snafu(display("rpc codec failure: {source}"))]
    Codec { source: bincode::Error },

    #[snafu(display("rpc frame of {size} bytes exceeds limit of {max}"))]
    FrameTooLarge { size: u32, max: u32 },

    #[snafu(display("unexpected rpc reply variant"))]
    UnexpectedReply,
}

/// Write one length-prefixed bincode frame.
pub(crate) async fn write_frame<T, W>(writer: &mut W, message: &T) -> Result<(), TransportError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(message).context(CodecSnafu)?;
    let size = payload.len() as u32;
    if size > MAX_RPC_MESSAGE_SIZE {
        return FrameTooLargeSnafu {
            size,
            max: MAX_RPC_MESSAGE_SIZE,
        }
        .fail();
    }
    writer.write_all(&size.to_be_bytes()).await.context(FrameIoSnafu)?;
    writer.write_all(&payload).await.context(FrameIoSnafu)?;
    writer.flush().await.context(FrameIoSnafu)
}

/// Read one length-prefixed bincode frame.
pub(crate) async fn read_frame<T, R>(reader: &mut R) -> Result<T, TransportError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut size_bytes = [0u8; 4];
    reader.read_exact(&mut size_bytes).await.context(FrameIoSnafu)?;
    let size = u32::from_be_bytes(size_bytes);
    if size > MAX_RPC_MESSAGE_SIZE {
        return FrameTooLargeSnafu {
            size,
            max: MAX_RPC_MESSAGE_SIZE,
        }
        .fail();
    }
    let mut payload = vec![0u8; size as usize];
    reader.read_exact(&mut payload).await.context(FrameIoSnafu)?;
    bincode::deserialize(&payload).context(CodecSnafu)
}

/// Factory handing out one client per peer.
#[derive(Debug, Default)]
pub struct Network;

impl RaftNetworkFactory<TypeConfig> for Network {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        NetworkConnection {
            target,
            addr: node.addr.clone(),
            stream: None,
        }
    }
}

/// Client side of the raft RPC protocol for a single peer.
pub struct NetworkConnection {
    target: NodeId,
    addr: String,
    stream: Option<TcpStream>,
}

impl NetworkConnection {
    async fn call(&mut self, request: RaftRpcRequest) -> Result<RaftRpcReply, TransportError> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.addr)
                .await
                .context(ConnectSnafu { addr: self.addr.clone() })?;
            debug!(target = self.target, addr = %self.addr, "connected to peer");
            self.stream = Some(stream);
        }

        let result = match self.stream.as_mut() {
            Some(stream) => {
                match write_frame(stream, &request).await {
                    Ok(()) => read_frame(stream).await,
                    Err(err) => Err(err),
                }
            }
            None => UnexpectedReplySnafu.fail(),
        };

        if result.is_err() {
            // Drop the broken connection; the next RPC re-dials.
            self.stream = None;
        }
        result
    }
}

fn transport_to_rpc_error<E>(err: TransportError) -> RPCError<NodeId, BasicNode, E>
where
    E: std::error::Error,
{
    match &err {
        TransportError::Connect { .. } => RPCError::Unreachable(Unreachable::new(&err)),
        _ => RPCError::Network(NetworkError::new(&err)),
    }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let reply = self
            .call(RaftRpcRequest::AppendEntries(rpc))
            .await
            .map_err(transport_to_rpc_error)?;
        match reply {
            RaftRpcReply::AppendEntries(Ok(resp)) => Ok(resp),
            RaftRpcReply::AppendEntries(Err(err)) => {
                Err(RPCError::RemoteError(RemoteError::new(self.target, err)))
            }
            _ => Err(transport_to_rpc_error(UnexpectedReplySnafu.build())),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let reply = self
            .call(RaftRpcRequest::InstallSnapshot(rpc))
            .await
            .map_err(transport_to_rpc_error)?;
        match reply {
            RaftRpcReply::InstallSnapshot(Ok(resp)) => Ok(resp),
            RaftRpcReply::InstallSnapshot(Err(err)) => {
                Err(RPCError::RemoteError(RemoteError::new(self.target, err)))
            }
            _ => Err(transport_to_rpc_error(UnexpectedReplySnafu.build())),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let reply = self
            .call(RaftRpcRequest::Vote(rpc))
            .await
            .map_err(transport_to_rpc_error)?;
        match reply {
            RaftRpcReply::Vote(Ok(resp)) => Ok(resp),
            RaftRpcReply::Vote(Err(err)) => {
                Err(RPCError::RemoteError(RemoteError::new(self.target, err)))
            }
            _ => Err(transport_to_rpc_error(UnexpectedReplySnafu.build())),
        }
    }
}
