//! recompose-rpc: Fingerprint-pinned mTLS client and server
//!
//! All in-cluster RPC rides on self-signed certificates authenticated by
//! SHA-256 fingerprint — there is no PKI. Both sides present certificates;
//! chain validation is replaced by a fingerprint-equality check inside the
//! handshake verifier (client side) or per-request authorization middleware
//! (server side).

pub mod client;
pub mod error;
pub mod server;
pub mod tls;

mod verify;

pub use client::{base_url, read_body, Client};
pub use error::RpcError;
pub use server::{require_auth, serve, PeerFingerprint};
pub use tls::{cert_fingerprint, load_or_generate_identity, Identity};

/// Decides whether a peer certificate fingerprint is trusted.
///
/// Fingerprints are lowercase hex SHA-256 digests of the DER-encoded leaf.
pub trait Authorizer: Send + Sync + 'static {
    fn trusts_cert(&self, fingerprint: &str) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    fn trusts_cert(&self, fingerprint: &str) -> bool {
        self(fingerprint)
    }
}
