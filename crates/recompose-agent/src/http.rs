//! Agent HTTP surface and coordinator registration
//!
//! The local API serves read-only status and logs, with the coordinator's
//! fingerprint as the sole trusted client. Registration is an outbound long
//! poll that tells the coordinator where this node can be reached.

use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Router};
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use recompose_core::jitter;
use recompose_rpc::{read_body, require_auth, Authorizer, RpcError};

use crate::runtime;
use crate::CoordClient;

/// Upper bound on one registration long poll before the connection is
/// recycled; jittered so a fleet doesn't reconnect in lockstep.
const REGISTER_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Builds the agent API router, trusting only the coordinator's cert.
pub fn api_router(coordinator_fingerprint: String) -> Router {
    let authorizer: Arc<dyn Authorizer> =
        Arc::new(move |fingerprint: &str| fingerprint == coordinator_fingerprint.as_str());

    Router::new()
        .route("/ps", get(get_ps))
        .route("/logs", get(get_logs))
        .route_layer(middleware::from_fn_with_state(authorizer, require_auth))
}

/// Lists managed containers, passing the runtime's JSON through untouched.
async fn get_ps() -> Response {
    match runtime::ps_raw().await {
        Ok(raw) => ([(header::CONTENT_TYPE, "application/json")], raw).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    container: String,

    #[serde(default)]
    since: String,

    #[serde(default)]
    follow: String,
}

/// Streams container logs, one flushed frame per line. Dropping the
/// response (client disconnect) kills the subprocess.
async fn get_logs(Query(query): Query<LogsQuery>) -> Response {
    match spawn_log_stream(&logs_args(&query)) {
        Ok(stream) => Body::from_stream(stream).into_response(),
        Err(err) => {
            tracing::warn!("error starting container log stream: {err:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response()
        }
    }
}

fn logs_args(query: &LogsQuery) -> Vec<String> {
    let mut args = vec!["logs".to_string()];
    if !query.follow.is_empty() {
        args.push("-f".to_string());
    }
    if !query.since.is_empty() {
        args.push("--since".to_string());
        args.push(query.since.clone());
    }
    args.push(query.container.clone());
    args
}

fn spawn_log_stream(args: &[String]) -> Result<ChildLineStream> {
    let mut child = Command::new("podman")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("starting log subprocess")?;

    let stdout = child.stdout.take().context("missing stdout pipe")?;
    let stderr = child.stderr.take().context("missing stderr pipe")?;

    // stdout and stderr are interleaved as their lines arrive.
    let lines = LinesStream::new(BufReader::new(stdout).lines())
        .merge(LinesStream::new(BufReader::new(stderr).lines()))
        .map(|line| {
            line.map(|mut text| {
                text.push('\n');
                Bytes::from(text)
            })
        });

    Ok(ChildLineStream {
        _child: child,
        lines: Box::pin(lines),
    })
}

/// A line stream that owns its subprocess, so dropping the stream tears the
/// process down with it.
struct ChildLineStream {
    _child: tokio::process::Child,
    lines: Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>,
}

impl Stream for ChildLineStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().lines.as_mut().poll_next(cx)
    }
}

/// One registration long poll: write our endpoint, then hold the connection
/// until the jittered window lapses. Both expiry paths count as success.
pub async fn register(client: &CoordClient, ip: &str, port: u16) -> Result<()> {
    let cancel = CancellationToken::new();
    let url = format!(
        "{}/registernode?ip={}&apiport={}",
        client.base_url, ip, port
    );

    let response = match client.client.post(&cancel, &url, Bytes::new()).await {
        Ok(response) => response,
        // Connection recycling timeouts are expected.
        Err(RpcError::DeadlineExceeded) => return Ok(()),
        Err(err) => return Err(err).context("registering with coordinator"),
    };

    tracing::info!("wrote node metadata to coordinator");
    let _ = tokio::time::timeout(jitter(REGISTER_WINDOW), read_body(response)).await;
    Ok(())
}
