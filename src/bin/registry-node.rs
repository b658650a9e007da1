//! Registry node binary: runs one store member.
//!
//! Opens the store, optionally bootstraps a single-node cluster, waits for
//! a leader, and then serves until interrupted or until the store raises a
//! fatal signal (for example an engine that cannot be reopened after a
//! restore).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use registry_store::Store;
use registry_store::StoreConfig;
use tracing::error;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "registry-node", about = "Replicated registry store node")]
struct Args {
    /// Stable raft identity of this node.
    #[arg(long)]
    node_id: u64,

    /// Root directory for the database, log, and snapshots.
    #[arg(long, default_value = "./registry-data")]
    data_dir: PathBuf,

    /// Listen address for raft RPC.
    #[arg(long, default_value = "127.0.0.1:7000")]
    raft_bind: String,

    /// Bootstrap a single-node cluster if no peers are configured.
    #[arg(long)]
    single: bool,

    /// Seconds to wait for a leader before giving up.
    #[arg(long, default_value_t = 30)]
    leader_wait_secs: u64,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = StoreConfig::new(args.node_id, &args.data_dir, &args.raft_bind);
    let store = Store::open(config, args.single)
        .await
        .context("failed to open store")?;

    match store
        .wait_for_leader(Duration::from_secs(args.leader_wait_secs))
        .await
    {
        Ok(leader) => info!(%leader, "cluster has a leader"),
        Err(err) => info!(error = %err, "no leader yet; serving anyway"),
    }

    let mut fatal = store.subscribe_fatal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        changed = fatal.changed() => {
            if changed.is_ok() {
                let reason = fatal.borrow().clone().unwrap_or_default();
                error!(%reason, "fatal store signal, shutting down");
            }
        }
    }

    store.close(true).await.context("failed to close store")?;
    Ok(())
}
