//! mTLS HTTP client
//!
//! A thin wrapper around a pooled hyper client whose TLS config presents our
//! certificate and pins the server by fingerprint. Responses with status
//! >= 300 are drained and converted into errors so call sites stay small.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;

use crate::error::{untrusted_server_fingerprint, RpcError};
use crate::tls::Identity;
use crate::verify::FingerprintServerVerifier;
use crate::Authorizer;

/// Default port of the coordinator's private listener.
pub const DEFAULT_COORDINATOR_PORT: u16 = 8123;

/// Returns the base URL used to reach `host`, which may be given as
/// `hostname` or `hostname:port`. Without a port the coordinator default
/// applies.
pub fn base_url(host: &str) -> String {
    if host.contains(':') {
        format!("https://{host}")
    } else {
        format!("https://{host}:{DEFAULT_COORDINATOR_PORT}")
    }
}

/// Fingerprint-pinning HTTPS client.
pub struct Client {
    http: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
    fingerprint: String,
}

impl Client {
    /// Builds a client presenting `identity` and trusting exactly the
    /// server fingerprints accepted by `authorizer`.
    pub fn new(
        identity: &Identity,
        timeout: Duration,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, RpcError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let tls = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|err| RpcError::Certificate(err.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(FingerprintServerVerifier::new(
                authorizer, provider,
            )))
            .with_client_auth_cert(identity.cert_chain(), identity.private_key())
            .map_err(|err| RpcError::Certificate(err.to_string()))?;

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_only()
            .enable_http1()
            .build();

        Ok(Self {
            http: HyperClient::builder(TokioExecutor::new()).build(connector),
            timeout,
            fingerprint: identity.fingerprint().to_string(),
        })
    }

    /// The fingerprint of our own certificate, as reported in
    /// [`RpcError::UntrustedClient`].
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub async fn get(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<Response<Incoming>, RpcError> {
        self.request(cancel, Method::GET, url, Bytes::new(), self.timeout)
            .await
    }

    /// GET with a per-request deadline overriding the client default.
    pub async fn get_with_deadline(
        &self,
        cancel: &CancellationToken,
        url: &str,
        deadline: Duration,
    ) -> Result<Response<Incoming>, RpcError> {
        self.request(cancel, Method::GET, url, Bytes::new(), deadline)
            .await
    }

    pub async fn post(
        &self,
        cancel: &CancellationToken,
        url: &str,
        body: Bytes,
    ) -> Result<Response<Incoming>, RpcError> {
        self.request(cancel, Method::POST, url, body, self.timeout)
            .await
    }

    async fn request(
        &self,
        cancel: &CancellationToken,
        method: Method,
        url: &str,
        body: Bytes,
        deadline: Duration,
    ) -> Result<Response<Incoming>, RpcError> {
        let request = Request::builder()
            .method(method)
            .uri(url)
            .body(Full::new(body))
            .map_err(|err| RpcError::InvalidRequest(err.to_string()))?;

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            outcome = tokio::time::timeout(deadline, self.http.request(request)) => match outcome {
                Err(_) => return Err(RpcError::DeadlineExceeded),
                Ok(Err(err)) => return Err(map_transport_error(err)),
                Ok(Ok(response)) => response,
            },
        };

        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            let _ = read_body(response).await;
            return Err(RpcError::UntrustedClient {
                fingerprint: self.fingerprint.clone(),
            });
        }
        if status.as_u16() >= 300 {
            let body = read_body(response).await.unwrap_or_default();
            return Err(RpcError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(response)
    }
}

/// Collects a response body into memory.
pub async fn read_body(response: Response<Incoming>) -> Result<Bytes, RpcError> {
    response
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|err| RpcError::Transport(Box::new(err)))
}

fn map_transport_error(err: hyper_util::client::legacy::Error) -> RpcError {
    match untrusted_server_fingerprint(&err) {
        Some(fingerprint) => RpcError::UntrustedServer { fingerprint },
        None => RpcError::Transport(Box::new(err)),
    }
}
