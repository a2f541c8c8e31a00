//! recompose agent daemon
//!
//! Long-polls the coordinator for this node's inventory, reconciles the
//! local container runtime to match, and serves read-only status and logs
//! back to the coordinator over mTLS.

mod http;
mod inventory;
mod runtime;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recompose_core::{run_loop, StateContainer};
use recompose_rpc as rpc;
use recompose_rpc::{read_body, RpcError};

use crate::inventory::InventoryContainer;

/// Client timeout generous enough to sit out a full inventory long poll.
const COORDINATOR_CLIENT_TIMEOUT: Duration = Duration::from_secs(45 * 60);

const RECONCILE_RESYNC: Duration = Duration::from_secs(30 * 60);
const RECONCILE_MAX_RETRY: Duration = Duration::from_secs(60 * 60);
const INVENTORY_MAX_RETRY: Duration = Duration::from_secs(15 * 60);
const REGISTER_MAX_RETRY: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "recompose-agent")]
#[command(about = "Node agent for the recompose cluster")]
#[command(version)]
struct Args {
    /// Host or host:port of the coordination server
    #[arg(long)]
    coordinator: String,

    /// Fingerprint of the coordination server's certificate
    #[arg(long)]
    coordinator_fingerprint: String,

    /// IP address to advertise to the coordinator (auto-detected when omitted)
    #[arg(long)]
    ip: Option<String>,

    /// Port to serve the agent API on. 0 to disable
    #[arg(long, default_value_t = 8234)]
    addr: u16,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Handle to the coordinator's private API.
pub struct CoordClient {
    pub client: rpc::Client,
    pub base_url: String,
}

impl CoordClient {
    /// Asks the coordinator to decrypt one ciphertext.
    pub async fn decrypt(&self, ciphertext: &str) -> Result<String, RpcError> {
        let cancel = CancellationToken::new();
        let response = self
            .client
            .post(
                &cancel,
                &format!("{}/decrypt", self.base_url),
                Bytes::from(ciphertext.to_owned()),
            )
            .await?;
        let body = read_body(response).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
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

    std::fs::create_dir_all(runtime::MOUNTS_DIR).context("creating mounts directory")?;

    let identity =
        rpc::load_or_generate_identity(Path::new(".")).context("generating certificate")?;
    tracing::info!("certificate fingerprint: {}", identity.fingerprint());

    let coordinator_fingerprint = args.coordinator_fingerprint.clone();
    let client = Arc::new(CoordClient {
        client: rpc::Client::new(
            &identity,
            COORDINATOR_CLIENT_TIMEOUT,
            Arc::new(move |fingerprint: &str| fingerprint == coordinator_fingerprint.as_str()),
        )
        .context("building coordinator client")?,
        base_url: rpc::base_url(&args.coordinator),
    });

    let state: InventoryContainer = StateContainer::new();

    // Reconciler: woken by inventory changes and its own re-entry, with a
    // periodic resync as a safety net.
    {
        let state = state.clone();
        let client = Arc::clone(&client);
        let watch = state.watch(CancellationToken::new());
        tokio::spawn(run_loop(
            watch,
            Some(RECONCILE_RESYNC),
            RECONCILE_MAX_RETRY,
            move || {
                let state = state.clone();
                let client = Arc::clone(&client);
                async move {
                    match runtime::reconcile(&client, &state).await {
                        Ok(()) => true,
                        Err(err) => {
                            tracing::warn!("error syncing container runtime: {err:#}");
                            false
                        }
                    }
                }
            },
        ));
    }

    // Inventory long poll: re-driven continuously; the server blocks until
    // something changes, so the tight signal just reconnects.
    {
        let state = state.clone();
        let client = Arc::clone(&client);
        let inventory_file = PathBuf::from("inventory.toml");
        tokio::spawn(run_loop(
            tight_signal(),
            None,
            INVENTORY_MAX_RETRY,
            move || {
                let state = state.clone();
                let client = Arc::clone(&client);
                let inventory_file = inventory_file.clone();
                async move {
                    match inventory::sync_inventory(&client, &inventory_file, &state).await {
                        Ok(()) => true,
                        Err(err) => {
                            tracing::warn!("error getting inventory from coordinator: {err:#}");
                            false
                        }
                    }
                }
            },
        ));
    }

    // Endpoint registration long poll.
    {
        let client = Arc::clone(&client);
        let ip = match &args.ip {
            Some(ip) => ip.clone(),
            None => outbound_ip()
                .context("unable to determine outbound IP address")?
                .to_string(),
        };
        let port = args.addr;
        tokio::spawn(run_loop(tight_signal(), None, REGISTER_MAX_RETRY, move || {
            let client = Arc::clone(&client);
            let ip = ip.clone();
            async move {
                match http::register(&client, &ip, port).await {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(
                            "error registering node metadata with coordinator: {err:#}"
                        );
                        false
                    }
                }
            }
        }));
    }

    if args.addr == 0 {
        tracing::info!("agent API disabled");
        shutdown_signal().await;
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.addr))
        .await
        .with_context(|| format!("binding API listener on port {}", args.addr))?;
    tracing::info!("serving agent API on port {}", args.addr);

    let api = http::api_router(args.coordinator_fingerprint.clone());
    tokio::select! {
        result = rpc::serve(listener, &identity, api) => {
            result.context("running API HTTP server")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
        }
    }

    Ok(())
}

/// A signal source that always has a wake pending, driving a run loop
/// continuously (the loop's cooldown paces the reconnects).
fn tight_signal() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            if tx.send(()).await.is_err() {
                return;
            }
        }
    });
    rx
}

/// Detects the IP this host uses for outbound traffic. The probe socket is
/// never written to.
fn outbound_ip() -> Result<std::net::IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").context("binding probe socket")?;
    socket.connect("8.8.8.8:53").context("probing default route")?;
    Ok(socket.local_addr()?.ip())
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
