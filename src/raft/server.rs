//! Raft RPC server: accepts peer connections and forwards requests to the
//! local raft core.
//!
//! Each connection is served by its own task and can carry any number of
//! requests; the accept loop and every connection task stop on the
//! cancellation token. Transport failures end the connection, peers simply
//! re-dial.

use std::net::SocketAddr;

use openraft::Raft;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::raft::network::read_frame;
use crate::raft::network::write_frame;
use crate::raft::network::RaftRpcReply;
use crate::raft::network::RaftRpcRequest;
use crate::types::TypeConfig;

/// Handle to the listening RPC server.
pub struct RaftServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RaftServer {
    /// Bind `addr` and start serving the given raft core.
    pub async fn bind(addr: &str, raft: Raft<TypeConfig>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(listener, raft, cancel.clone()));
        info!(%local_addr, "raft rpc server listening");
        Ok(Self {
            local_addr,
            cancel,
            handle,
        })
    }

    /// The bound address; this is what peers must dial.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and tear down connection tasks.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run(listener: TcpListener, raft: Raft<TypeConfig>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("raft rpc server shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted raft connection");
                    tokio::spawn(serve_connection(stream, raft.clone(), cancel.clone()));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    }
}

async fn serve_connection(mut stream: TcpStream, raft: Raft<TypeConfig>, cancel: CancellationToken) {
    loop {
        let request: RaftRpcRequest = tokio::select! {
            _ = cancel.cancelled() => return,
            framed = read_frame(&mut stream) => match framed {
                Ok(request) => request,
                Err(err) => {
                    // EOF on a quiet connection is the normal close path.
                    debug!(error = %err, "raft connection closed");
                    return;
                }
            }
        };

        let reply = match request {
            RaftRpcRequest::AppendEntries(rpc) => {
                RaftRpcReply::AppendEntries(raft.append_entries(rpc).await)
            }
            RaftRpcRequest::InstallSnapshot(rpc) => {
                RaftRpcReply::InstallSnapshot(raft.install_snapshot(rpc).await)
            }
            RaftRpcRequest::Vote(rpc) => RaftRpcReply::Vote(raft.vote(rpc).await),
        };

        if let Err(err) = write_frame(&mut stream, &reply).await {
            debug!(error = %err, "failed to write raft reply");
            return;
        }
    }
}
