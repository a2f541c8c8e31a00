//! recompose coordinator daemon
//!
//! Pulls the GitOps repository, indexes the cluster specification, and
//! serves per-node inventories to agents over fingerprint-pinned mTLS.
//! Secrets are decrypted here only; agents receive plaintext on demand.

mod http;
mod inventory;
mod store;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recompose_core::{run_loop, StateContainer};
use recompose_rpc as rpc;

use crate::http::ApiState;
use crate::inventory::{sync_inventory, AgentAuthorizer, InventoryContainer};
use crate::store::NodeMetadataStore;

/// Cap on the sync loop's failure backoff.
const SYNC_MAX_RETRY: Duration = Duration::from_secs(30 * 60);

/// Timeout applied to coordinator-to-agent requests other than status
/// queries (log streams may run long).
const AGENT_CLIENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Parser)]
#[command(name = "recompose-coordinator")]
#[command(about = "GitOps coordinator for the recompose cluster")]
#[command(version)]
struct Args {
    /// Address on which to serve the private API (accessed by agents)
    #[arg(long, default_value = ":8123")]
    private_addr: String,

    /// Optional address on which to serve the public API (i.e. webhooks)
    #[arg(long)]
    public_addr: Option<String>,

    /// How often to `git pull`, in seconds
    #[arg(long, default_value_t = 300)]
    git_polling_interval: u64,

    /// Per-node deadline for status queries, in seconds
    #[arg(long, default_value_t = 15)]
    agent_timeout: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let webhook_key = std::env::var("WEBHOOK_HMAC_KEY")
        .unwrap_or_default()
        .into_bytes();

    let repo_dir = PathBuf::from("./repo");
    std::fs::create_dir_all(&repo_dir).context("creating git repo directory")?;

    let identity =
        rpc::load_or_generate_identity(Path::new(".")).context("generating certificate")?;
    tracing::info!("certificate fingerprint: {}", identity.fingerprint());

    let inventory: InventoryContainer = StateContainer::new();
    let nodes = Arc::new(NodeMetadataStore::new());
    let (webhook_tx, webhook_rx) = mpsc::channel(1);

    if let Some(public_addr) = &args.public_addr {
        let router = http::webhook_router(webhook_key, webhook_tx.clone());
        let listener = tokio::net::TcpListener::bind(listen_addr(public_addr))
            .await
            .with_context(|| format!("binding public listener on {public_addr}"))?;
        tracing::info!("serving public API on {public_addr}");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                tracing::error!("fatal error while running public HTTP server: {err}");
            }
        });
    }

    let agent_client = Arc::new(
        rpc::Client::new(
            &identity,
            AGENT_CLIENT_TIMEOUT,
            Arc::new(AgentAuthorizer(inventory.clone())),
        )
        .context("building agent client")?,
    );

    // The private server must not come up before the first successful sync,
    // or nodes reconnecting after a cold restart would be rejected as
    // unknown.
    let (synced_tx, synced_rx) = oneshot::channel();
    let synced_tx = Arc::new(Mutex::new(Some(synced_tx)));
    {
        let inventory = inventory.clone();
        let nodes = Arc::clone(&nodes);
        let repo_dir = repo_dir.clone();
        let period = Duration::from_secs(args.git_polling_interval);
        tokio::spawn(run_loop(webhook_rx, Some(period), SYNC_MAX_RETRY, move || {
            let inventory = inventory.clone();
            let nodes = Arc::clone(&nodes);
            let repo_dir = repo_dir.clone();
            let synced_tx = Arc::clone(&synced_tx);
            async move {
                match sync_inventory(&repo_dir, &inventory, &nodes).await {
                    Ok(()) => {
                        if let Some(tx) = synced_tx.lock().unwrap().take() {
                            let _ = tx.send(());
                        }
                        true
                    }
                    Err(err) => {
                        tracing::warn!("error syncing inventory: {err:#}");
                        false
                    }
                }
            }
        }));
    }

    tracing::info!("waiting for initial inventory sync...");
    let _ = synced_rx.await;

    let api = http::api_router(ApiState::new(
        inventory,
        nodes,
        agent_client,
        Duration::from_secs(args.agent_timeout),
    ));

    let private_addr = listen_addr(&args.private_addr);
    let listener = tokio::net::TcpListener::bind(&private_addr)
        .await
        .with_context(|| format!("binding private listener on {private_addr}"))?;
    tracing::info!("serving private API on {private_addr}");

    tokio::select! {
        result = rpc::serve(listener, &identity, api) => {
            result.context("running private API HTTP server")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
        }
    }

    Ok(())
}

/// Expands a `:port` shorthand to a bindable address.
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr_expands_port_shorthand() {
        assert_eq!(listen_addr(":8123"), "0.0.0.0:8123");
        assert_eq!(listen_addr("10.0.0.1:8123"), "10.0.0.1:8123");
    }
}
