//! Transport integration tests
//!
//! Exercises the real handshake over loopback sockets: trusted and
//! untrusted peers in both directions, error mapping for non-2xx responses,
//! and the fingerprint extension observed by handlers.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{middleware, Extension, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use recompose_rpc::{
    load_or_generate_identity, read_body, require_auth, serve, Authorizer, Client, Identity,
    PeerFingerprint, RpcError,
};

/// Certificate generation is comparatively slow, so both test identities are
/// created once and shared by every test in this file.
fn identities() -> &'static (Identity, Identity) {
    static IDENTITIES: OnceLock<(Identity, Identity)> = OnceLock::new();
    IDENTITIES.get_or_init(|| {
        let server_dir = tempfile::tempdir().unwrap().keep();
        let client_dir = tempfile::tempdir().unwrap().keep();
        (
            load_or_generate_identity(&server_dir).unwrap(),
            load_or_generate_identity(&client_dir).unwrap(),
        )
    })
}

fn trust_exactly(fingerprint: String) -> Arc<dyn Authorizer> {
    Arc::new(move |candidate: &str| candidate == fingerprint)
}

fn trust_nothing() -> Arc<dyn Authorizer> {
    Arc::new(|_: &str| false)
}

async fn echo_fingerprint(Extension(peer): Extension<PeerFingerprint>) -> String {
    peer.0
}

async fn bad_gateway() -> (StatusCode, &'static str) {
    (StatusCode::BAD_GATEWAY, "test error")
}

async fn spawn_server(
    identity: Identity,
    server_authorizer: Arc<dyn Authorizer>,
    router: Router,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let router = router.route_layer(middleware::from_fn_with_state(
        server_authorizer,
        require_auth,
    ));

    tokio::spawn(async move {
        let _ = serve(listener, &identity, router).await;
    });

    addr
}

#[tokio::test]
async fn test_happy_path_exposes_client_fingerprint() {
    let (server_id, client_id) = identities().clone();
    let addr = spawn_server(
        server_id.clone(),
        trust_exactly(client_id.fingerprint().to_string()),
        Router::new().route("/", get(echo_fingerprint)),
    )
    .await;

    let client = Client::new(
        &client_id,
        Duration::from_secs(5),
        trust_exactly(server_id.fingerprint().to_string()),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let response = client
        .get(&cancel, &format!("https://{addr}/"))
        .await
        .unwrap();
    let body = read_body(response).await.unwrap();

    assert_eq!(
        String::from_utf8_lossy(&body),
        client_id.fingerprint(),
        "the handler should observe the verified client fingerprint"
    );
}

#[tokio::test]
async fn test_untrusted_client_is_rejected_with_403() {
    let (server_id, client_id) = identities().clone();
    let addr = spawn_server(
        server_id.clone(),
        trust_nothing(),
        Router::new().route("/", get(echo_fingerprint)),
    )
    .await;

    let client = Client::new(
        &client_id,
        Duration::from_secs(5),
        trust_exactly(server_id.fingerprint().to_string()),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let err = client
        .get(&cancel, &format!("https://{addr}/"))
        .await
        .unwrap_err();

    match err {
        RpcError::UntrustedClient { fingerprint } => {
            assert_eq!(fingerprint, client_id.fingerprint());
        }
        other => panic!("expected UntrustedClient, got {other:?}"),
    }
}

#[tokio::test]
async fn test_untrusted_server_fails_the_handshake() {
    let (server_id, client_id) = identities().clone();
    let addr = spawn_server(
        server_id.clone(),
        trust_exactly(client_id.fingerprint().to_string()),
        Router::new().route("/", get(echo_fingerprint)),
    )
    .await;

    let client = Client::new(&client_id, Duration::from_secs(5), trust_nothing()).unwrap();

    let cancel = CancellationToken::new();
    let err = client
        .get(&cancel, &format!("https://{addr}/"))
        .await
        .unwrap_err();

    match err {
        RpcError::UntrustedServer { fingerprint } => {
            assert_eq!(fingerprint, server_id.fingerprint());
        }
        other => panic!("expected UntrustedServer, got {other:?}"),
    }
}

#[tokio::test]
async fn test_5xx_responses_become_status_errors() {
    let (server_id, client_id) = identities().clone();
    let addr = spawn_server(
        server_id.clone(),
        trust_exactly(client_id.fingerprint().to_string()),
        Router::new().route("/", get(bad_gateway)),
    )
    .await;

    let client = Client::new(
        &client_id,
        Duration::from_secs(5),
        trust_exactly(server_id.fingerprint().to_string()),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let err = client
        .get(&cancel, &format!("https://{addr}/"))
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "server error status: 502, body: test error"
    );
}

#[tokio::test]
async fn test_2xx_non_200_is_not_an_error() {
    async fn no_content() -> StatusCode {
        StatusCode::NO_CONTENT
    }

    let (server_id, client_id) = identities().clone();
    let addr = spawn_server(
        server_id.clone(),
        trust_exactly(client_id.fingerprint().to_string()),
        Router::new().route("/", get(no_content)),
    )
    .await;

    let client = Client::new(
        &client_id,
        Duration::from_secs(5),
        trust_exactly(server_id.fingerprint().to_string()),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let response = client
        .get(&cancel, &format!("https://{addr}/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
