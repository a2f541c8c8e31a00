//! RPC error types

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced by the RPC substrate.
///
/// The two trust variants are surfaced verbatim to callers so user
/// interfaces can render remediation steps including the offending
/// fingerprint.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The server presented a certificate whose fingerprint we don't trust.
    #[error("untrusted server certificate")]
    UntrustedServer { fingerprint: String },

    /// The server rejected our client certificate (HTTP 403).
    #[error("server does not trust this client")]
    UntrustedClient { fingerprint: String },

    /// Any other non-2xx response.
    #[error("server error status: {status}, body: {body}")]
    Status { status: u16, body: String },

    /// The per-request deadline elapsed. Expected on long-poll endpoints.
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// The caller's cancellation token fired.
    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Marker error injected into the rustls handshake when no presented
/// certificate matched a trusted fingerprint. Recovered from the transport
/// error chain and converted to [`RpcError::UntrustedServer`].
#[derive(Debug, Clone)]
pub(crate) struct UntrustedServerCert {
    pub fingerprint: String,
}

impl fmt::Display for UntrustedServerCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "untrusted server certificate {}", self.fingerprint)
    }
}

impl std::error::Error for UntrustedServerCert {}

/// Walks an error's source chain looking for the handshake rejection
/// planted by the fingerprint verifier.
pub(crate) fn untrusted_server_fingerprint(
    err: &(dyn std::error::Error + 'static),
) -> Option<String> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(marker) = e.downcast_ref::<UntrustedServerCert>() {
            return Some(marker.fingerprint.clone());
        }
        // rustls wraps foreign errors without exposing them as sources.
        if let Some(rustls::Error::Other(other)) = e.downcast_ref::<rustls::Error>() {
            if let Some(marker) = other.0.downcast_ref::<UntrustedServerCert>() {
                return Some(marker.fingerprint.clone());
            }
        }
        current = e.source();
    }
    None
}

/// Helper for building the rustls-side rejection.
pub(crate) fn untrusted_server_error(fingerprint: String) -> rustls::Error {
    rustls::Error::Other(rustls::OtherError(Arc::new(UntrustedServerCert {
        fingerprint,
    })))
}
