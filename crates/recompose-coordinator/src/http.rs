//! Coordinator HTTP surface
//!
//! Two routers: the public webhook endpoint (plain HTTP, HMAC-gated) and the
//! private mTLS API. Private routes split into two trust domains — agents
//! (nodes declared in the inventory) and admin clients.

use std::convert::Infallible;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::body::Body;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use bytes::Bytes;
use chrono::DateTime;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use serde::Deserialize;
use sha2::Sha256;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use recompose_core::api::{ClusterState, ContainerState, NodeInventory};
use recompose_rpc::{read_body, require_auth, Client, PeerFingerprint, RpcError};

use crate::inventory::{AgentAuthorizer, ClientAuthorizer, InventoryContainer};
use crate::store::{NodeMetadata, NodeMetadataStore};

/// How long one `/nodeinventory` long poll may stay open before the agent
/// has to reconnect.
const LONG_POLL_WINDOW: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
pub struct ApiState {
    pub inventory: InventoryContainer,
    pub nodes: Arc<NodeMetadataStore>,
    pub agent_client: Arc<Client>,
    pub agent_timeout: Duration,
    /// Held while an inventory response is written, to flatten load when
    /// many nodes reconnect at once.
    response_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ApiState {
    pub fn new(
        inventory: InventoryContainer,
        nodes: Arc<NodeMetadataStore>,
        agent_client: Arc<Client>,
        agent_timeout: Duration,
    ) -> Self {
        Self {
            inventory,
            nodes,
            agent_client,
            agent_timeout,
            response_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Builds the private API router served behind mTLS.
pub fn api_router(state: ApiState) -> Router {
    let agent_auth: Arc<dyn recompose_rpc::Authorizer> =
        Arc::new(AgentAuthorizer(state.inventory.clone()));
    let client_auth: Arc<dyn recompose_rpc::Authorizer> =
        Arc::new(ClientAuthorizer(state.inventory.clone()));

    let agent_routes = Router::new()
        .route("/nodeinventory", get(get_node_inventory))
        .route("/decrypt", post(decrypt))
        .route("/registernode", post(register_node))
        .route_layer(middleware::from_fn_with_state(agent_auth, require_auth));

    let client_routes = Router::new()
        .route("/nodes/{fingerprint}/logs", get(proxy_logs))
        .route("/status", get(get_status))
        .route_layer(middleware::from_fn_with_state(client_auth, require_auth));

    agent_routes.merge(client_routes).with_state(state)
}

#[derive(Clone)]
struct WebhookState {
    key: Arc<Vec<u8>>,
    signal: mpsc::Sender<()>,
}

/// Builds the public webhook router. A valid `X-Hub-Signature-256` pushes
/// one coalesced wake onto the sync signal channel.
pub fn webhook_router(key: Vec<u8>, signal: mpsc::Sender<()>) -> Router {
    Router::new().route("/hook", post(hook)).with_state(WebhookState {
        key: Arc::new(key),
        signal,
    })
}

async fn hook(State(state): State<WebhookState>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(signature) = hex::decode(signature) else {
        return StatusCode::UNAUTHORIZED;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(&state.key) else {
        return StatusCode::INTERNAL_SERVER_ERROR;
    };
    mac.update(&body);
    if mac.verify_slice(&signature).is_err() {
        return StatusCode::UNAUTHORIZED;
    }

    let _ = state.signal.try_send(());
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct InventoryQuery {
    #[serde(default)]
    after: String,
}

/// Long-poll for the calling node's inventory. Responds immediately unless
/// `after` matches the current SHA, in which case the request parks on a
/// state watcher until the inventory moves or the window lapses.
async fn get_node_inventory(
    State(state): State<ApiState>,
    Extension(PeerFingerprint(fingerprint)): Extension<PeerFingerprint>,
    Query(query): Query<InventoryQuery>,
) -> Response {
    let deadline = tokio::time::Instant::now() + LONG_POLL_WINDOW;
    let mut watcher = None;

    loop {
        if !query.after.is_empty() && watcher.is_none() {
            let cancel = CancellationToken::new();
            let rx = state.inventory.watch(cancel.clone());
            // Dropping the guard on any exit path deregisters the watcher.
            watcher = Some((rx, cancel.drop_guard()));
        }

        let current = state.inventory.get();
        let changed = current
            .as_ref()
            .map(|inv| inv.git_sha != query.after)
            .unwrap_or(false);

        if query.after.is_empty() || changed {
            let node_inventory =
                current.and_then(|inv| inv.nodes_by_fingerprint.get(&fingerprint).cloned());
            return inventory_response(&state, node_inventory).await;
        }

        let Some((rx, _)) = watcher.as_mut() else {
            // after == current SHA and after is non-empty, so the watcher
            // was registered above.
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(())) => continue,
            Ok(None) | Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        }
    }
}

async fn inventory_response(state: &ApiState, inventory: Option<Arc<NodeInventory>>) -> Response {
    let body = match inventory {
        Some(inventory) => match toml::to_string(inventory.as_ref()) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!("error encoding node inventory: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        },
        // An authorized node with no declared containers gets an empty
        // document, which decodes as an empty inventory.
        None => String::new(),
    };

    let permit = state.response_lock.clone().lock_owned().await;
    let stream = tokio_stream::once((Bytes::from(body), permit))
        .map(|(bytes, _permit)| Ok::<_, Infallible>(bytes));
    Body::from_stream(stream).into_response()
}

/// Decrypts the request body with the local age identity.
async fn decrypt(body: Bytes) -> Response {
    match run_decrypt(body).await {
        Ok(plaintext) => plaintext.into_response(),
        Err(err) => {
            tracing::error!("error while decrypting secret: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn run_decrypt(ciphertext: Bytes) -> Result<Vec<u8>> {
    let mut child = Command::new("age")
        .args(["--decrypt", "--identity=identity.txt"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("starting age")?;

    let mut stdin = child.stdin.take().context("opening age stdin")?;
    stdin.write_all(&ciphertext).await?;
    drop(stdin);

    let output = child.wait_with_output().await.context("running age")?;
    if !output.status.success() {
        bail!("age: {}", String::from_utf8_lossy(&output.stderr).trim());
    }

    let mut plaintext = output.stdout;
    if plaintext.last() == Some(&b'\n') {
        plaintext.pop();
    }
    Ok(plaintext)
}

#[derive(Debug, Deserialize)]
struct RegisterQuery {
    #[serde(default)]
    ip: String,

    #[serde(default)]
    apiport: u16,
}

/// Stores the calling node's endpoint, then keeps the response body open so
/// the agent's long poll doubles as connection recycling.
async fn register_node(
    State(state): State<ApiState>,
    Extension(PeerFingerprint(fingerprint)): Extension<PeerFingerprint>,
    Query(query): Query<RegisterQuery>,
) -> Response {
    let meta = NodeMetadata {
        fingerprint: fingerprint.clone(),
        ip: query.ip,
        api_port: query.apiport,
    };
    tracing::info!(
        "received metadata for node: {fingerprint} - ip={} apiport={}",
        meta.ip,
        meta.api_port
    );
    state.nodes.set(fingerprint, meta);

    Body::from_stream(tokio_stream::pending::<Result<Bytes, Infallible>>()).into_response()
}

/// Reverse-proxies a log request to the agent registered at `fingerprint`.
async fn proxy_logs(
    State(state): State<ApiState>,
    Path(fingerprint): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let Some(meta) = state.nodes.get(&fingerprint) else {
        return unknown_node_response();
    };
    if meta.api_port == 0 {
        return unknown_node_response();
    }

    let mut url = format!("https://{}:{}/logs", meta.ip, meta.api_port);
    if let Some(query) = query {
        url.push('?');
        url.push_str(&query);
    }

    let cancel = CancellationToken::new();
    match state.agent_client.get(&cancel, &url).await {
        Ok(upstream) => {
            let status = upstream.status();
            let body = Body::from_stream(upstream.into_body().into_data_stream());
            Response::builder()
                .status(status)
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(RpcError::Status { status, body }) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::warn!("error while proxying logs to node {fingerprint}: {err}");
            (StatusCode::BAD_GATEWAY, "agent unreachable").into_response()
        }
    }
}

fn unknown_node_response() -> Response {
    (
        StatusCode::BAD_REQUEST,
        "node with the given fingerprint is not known",
    )
        .into_response()
}

/// Queries every registered node concurrently and merges the results.
/// Responds 206 when any node could not be reached.
async fn get_status(State(state): State<ApiState>) -> Response {
    let mut queries = tokio::task::JoinSet::new();
    for node in state.nodes.list() {
        let client = Arc::clone(&state.agent_client);
        let deadline = state.agent_timeout;
        queries.spawn(async move {
            get_agent_status(&client, &node, deadline)
                .await
                .map_err(|err| (node.fingerprint.clone(), err))
        });
    }

    let mut cluster = ClusterState::default();
    let mut partial = false;
    while let Some(joined) = queries.join_next().await {
        match joined {
            Ok(Ok(mut containers)) => cluster.containers.append(&mut containers),
            Ok(Err((fingerprint, err))) => {
                tracing::warn!("error while getting status from node {fingerprint}: {err:#}");
                partial = true;
            }
            Err(err) => {
                tracing::warn!("status query task failed: {err}");
                partial = true;
            }
        }
    }

    let status = if partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    (status, Json(cluster)).into_response()
}

/// Raw shape of the runtime's `ps --format=json` entries, as forwarded
/// verbatim by agents.
#[derive(Debug, Deserialize)]
struct PsRaw {
    #[serde(default, rename = "Names")]
    names: Vec<String>,

    #[serde(default, rename = "ExitedAt")]
    exited_at: i64,

    #[serde(default, rename = "Created")]
    created: i64,
}

async fn get_agent_status(
    client: &Client,
    node: &NodeMetadata,
    deadline: Duration,
) -> Result<Vec<ContainerState>> {
    let cancel = CancellationToken::new();
    let url = format!("https://{}:{}/ps", node.ip, node.api_port);

    let fetch = async {
        let response = client.get_with_deadline(&cancel, &url, deadline).await?;
        read_body(response).await
    };
    let body = tokio::time::timeout(deadline, fetch)
        .await
        .map_err(|_| anyhow::anyhow!("deadline exceeded"))?
        .context("querying agent")?;

    let raw: Vec<PsRaw> = serde_json::from_slice(&body).context("decoding agent ps output")?;
    Ok(raw
        .into_iter()
        .map(|entry| ContainerState {
            name: entry.names.first().cloned().unwrap_or_default(),
            node_fingerprint: node.fingerprint.clone(),
            created: DateTime::from_timestamp(entry.created, 0).unwrap_or_default(),
            last_restart: (entry.exited_at > 0)
                .then(|| DateTime::from_timestamp(entry.exited_at, 0).unwrap_or_default()),
        })
        .collect())
}
