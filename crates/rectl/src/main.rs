//! rectl: Recompose admin CLI
//!
//! Talks to the coordinator's private API using a client certificate kept
//! under `~/.rectl`. Trust in both directions is established manually: the
//! coordinator's fingerprint goes into `~/.rectl/trustedcerts`, ours into
//! the cluster's `cluster.toml`.

mod logs;
mod status;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recompose_rpc as rpc;
use recompose_rpc::RpcError;

#[derive(Parser)]
#[command(name = "rectl")]
#[command(about = "Recompose admin tools")]
#[command(version)]
struct Cli {
    /// Address of the Recompose coordinator, e.g. `recompose.mydomain` or
    /// `recompose.mydomain:8124`
    #[arg(long, env = "RECOMPOSE_COORDINATOR")]
    coordinator: String,

    /// Timeout when sending requests to the Recompose coordinator, in seconds
    #[arg(long, default_value_t = 15)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Get the status of all containers running on the cluster
    Status,

    /// Get logs from a particular container
    Logs {
        /// Container name, or `<name>@<node fingerprint prefix>` when the
        /// name runs on several nodes
        name: String,

        /// Start of the time window to query, in seconds before now
        #[arg(long)]
        since: Option<u64>,
    },
}

/// Everything a command needs to talk to the coordinator.
pub struct AppContext {
    pub client: rpc::Client,
    pub base_url: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let Err(err) = run(cli).await else {
        return;
    };

    match err.downcast_ref::<RpcError>() {
        Some(RpcError::UntrustedServer { fingerprint }) => {
            eprintln!(
                "The certificate presented by the server is not trusted. \
                 Use this command to trust it:\n\n  echo \"{fingerprint}\" >> ~/.rectl/trustedcerts\n"
            );
        }
        Some(RpcError::UntrustedClient { fingerprint }) => {
            eprintln!(
                "The server does not trust your client certificate.\n\
                 Add its fingerprint to the cluster's `cluster.toml` like this:\n\n\
                 [[ client ]]\nfingerprint = \"{fingerprint}\"\n"
            );
        }
        _ => eprintln!("error: {err:#}"),
    }
    std::process::exit(1);
}

async fn run(cli: Cli) -> Result<()> {
    let app = setup(&cli)?;

    match &cli.command {
        Commands::Status => status::status_cmd(&app).await,
        Commands::Logs { name, since } => logs::logs_cmd(&app, name, *since).await,
    }
}

fn setup(cli: &Cli) -> Result<AppContext> {
    let home = dirs::home_dir().context("getting homedir")?;
    let dir = home.join(".rectl");

    let identity = rpc::load_or_generate_identity(&dir).context("generating cert")?;
    let trusted = load_trusted_certs(&dir).context("reading trusted certs file")?;

    let client = rpc::Client::new(
        &identity,
        Duration::from_secs(cli.timeout),
        Arc::new(move |fingerprint: &str| trusted.contains(fingerprint)),
    )
    .context("building client")?;

    Ok(AppContext {
        client,
        base_url: rpc::base_url(&cli.coordinator),
    })
}

/// Loads `trustedcerts`: one fingerprint per line. A missing file means
/// nothing is trusted yet.
fn load_trusted_certs(dir: &Path) -> Result<HashSet<String>> {
    match std::fs::read_to_string(dir.join("trustedcerts")) {
        Ok(text) => Ok(text
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(err) => Err(err.into()),
    }
}
