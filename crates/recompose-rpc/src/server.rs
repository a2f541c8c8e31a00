//! mTLS HTTP server
//!
//! One TLS listener per process. The accept loop computes the peer leaf's
//! fingerprint once per connection and exposes it to handlers as a request
//! extension; route-level middleware enforces the caller's authorizer.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::error::RpcError;
use crate::tls::{cert_fingerprint, Identity};
use crate::verify::AcceptAnyClientCert;
use crate::Authorizer;

/// The verified fingerprint of the connection's client certificate.
///
/// Inserted by the accept loop for every request on an authenticated
/// connection; [`require_auth`] checks it against an [`Authorizer`] before a
/// handler runs.
#[derive(Debug, Clone)]
pub struct PeerFingerprint(pub String);

/// Serves `router` on `listener` with mutual TLS.
///
/// Any client certificate is accepted during the handshake; authorization is
/// per-request. Returns only when the listener fails.
pub async fn serve(
    listener: TcpListener,
    identity: &Identity,
    router: Router,
) -> Result<(), RpcError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let config = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|err| RpcError::Certificate(err.to_string()))?
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new(provider)))
        .with_single_cert(identity.cert_chain(), identity.private_key())
        .map_err(|err| RpcError::Certificate(err.to_string()))?;

    let acceptor = TlsAcceptor::from(Arc::new(config));
    let router = router.layer(axum::middleware::from_fn(log_requests));

    loop {
        let (stream, remote) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, acceptor, router).await {
                tracing::debug!("connection from {remote}: {err}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    router: Router,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let tls = acceptor.accept(stream).await?;

    let fingerprint = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert_fingerprint(cert));

    let service = match fingerprint {
        Some(fp) => router.layer(Extension(PeerFingerprint(fp))),
        None => router,
    };

    ConnectionBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls), TowerToHyperService::new(service))
        .await?;

    Ok(())
}

/// Middleware enforcing fingerprint authorization.
///
/// 401 without a client certificate, 403 when the authorizer rejects it.
/// Downstream handlers observe the verified [`PeerFingerprint`] extension.
pub async fn require_auth(
    State(authorizer): State<Arc<dyn Authorizer>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(PeerFingerprint(fingerprint)) =
        request.extensions().get::<PeerFingerprint>().cloned()
    else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    if !authorizer.trusts_cert(&fingerprint) {
        return StatusCode::FORBIDDEN.into_response();
    }

    next.run(request).await
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;
    tracing::info!("{} {} - {}", method, uri, response.status().as_u16());
    response
}
