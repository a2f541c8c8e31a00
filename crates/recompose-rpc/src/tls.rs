//! Certificate lifecycle
//!
//! Each process owns a long-lived self-signed certificate stored under
//! `tls/` in its working directory. On startup the existing key pair is
//! reused when it parses; otherwise a fresh RSA-2048 certificate is
//! generated. A sibling `cert-fingerprint.txt` always holds the hex SHA-256
//! of the DER leaf so operators can exchange trust out of band.

use std::fs;
use std::io::BufReader;
use std::path::Path;

use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};

use crate::error::RpcError;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "cert-private-key.pem";
const FINGERPRINT_FILE: &str = "cert-fingerprint.txt";

const COMMON_NAME: &str = "recompose";
const VALIDITY_DAYS: i64 = 3650;

/// A process identity: certificate, private key, and leaf fingerprint.
#[derive(Debug)]
pub struct Identity {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
    fingerprint: String,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert: self.cert.clone(),
            key: self.key.clone_key(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

impl Identity {
    /// The certificate chain to present during handshakes (a single leaf).
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert.clone()]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// Lowercase hex SHA-256 of the DER leaf certificate.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Returns the SHA-256 fingerprint of a DER-encoded certificate.
pub fn cert_fingerprint(cert: &[u8]) -> String {
    hex::encode(Sha256::digest(cert))
}

/// Loads the identity stored under `<dir>/tls/`, generating it first if the
/// key or certificate is missing or fails to parse. The fingerprint file is
/// rewritten whenever it is absent.
pub fn load_or_generate_identity(dir: &Path) -> Result<Identity, RpcError> {
    let tls_dir = dir.join("tls");
    fs::create_dir_all(&tls_dir)?;

    let cert_file = tls_dir.join(CERT_FILE);
    let key_file = tls_dir.join(KEY_FILE);
    let fingerprint_file = tls_dir.join(FINGERPRINT_FILE);

    if let Some((cert, key)) = try_load(&cert_file, &key_file) {
        let fingerprint = cert_fingerprint(&cert);
        if !fingerprint_file.exists() {
            fs::write(&fingerprint_file, &fingerprint)?;
        }
        return Ok(Identity {
            cert,
            key,
            fingerprint,
        });
    }

    let (cert_pem, key_pem) = generate()?;
    fs::write(&cert_file, cert_pem)?;
    fs::write(&key_file, key_pem)?;

    let (cert, key) = try_load(&cert_file, &key_file).ok_or_else(|| {
        RpcError::Certificate("generated certificate failed to parse back".into())
    })?;

    let fingerprint = cert_fingerprint(&cert);
    fs::write(&fingerprint_file, &fingerprint)?;

    Ok(Identity {
        cert,
        key,
        fingerprint,
    })
}

fn try_load(
    cert_file: &Path,
    key_file: &Path,
) -> Option<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let cert_pem = fs::read(cert_file).ok()?;
    let key_pem = fs::read(key_file).ok()?;

    let cert = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .ok()?
        .into_iter()
        .next()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice())).ok()??;

    Some((cert, key))
}

fn generate() -> Result<(String, String), RpcError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|err| RpcError::Certificate(format!("generating RSA key: {err}")))?;
    let key_der = private_key
        .to_pkcs8_der()
        .map_err(|err| RpcError::Certificate(format!("encoding RSA key: {err}")))?;

    let key_pair = rcgen::KeyPair::try_from(key_der.as_bytes())
        .map_err(|err| RpcError::Certificate(format!("loading RSA key: {err}")))?;

    let mut params = rcgen::CertificateParams::default();
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, COMMON_NAME);
    params.distinguished_name = dn;
    params.serial_number = Some(rcgen::SerialNumber::from(1u64));
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(VALIDITY_DAYS);
    params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature];

    let cert = params
        .self_signed(&key_pair)
        .map_err(|err| RpcError::Certificate(format!("signing certificate: {err}")))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_stable_across_reloads() {
        let dir = tempfile::tempdir().unwrap();

        let identity = load_or_generate_identity(dir.path()).unwrap();
        assert_eq!(identity.fingerprint().len(), 64);
        assert_eq!(
            identity.fingerprint(),
            cert_fingerprint(&identity.cert_chain()[0])
        );
        let initial = identity.fingerprint().to_string();

        let reloaded = load_or_generate_identity(dir.path()).unwrap();
        assert_eq!(reloaded.fingerprint(), initial);
        assert_eq!(
            cert_fingerprint(&reloaded.cert_chain()[0]),
            initial,
            "reload must reuse the existing certificate"
        );
    }

    #[test]
    fn test_fingerprint_file_is_regenerated_from_cert() {
        let dir = tempfile::tempdir().unwrap();

        let initial = load_or_generate_identity(dir.path())
            .unwrap()
            .fingerprint()
            .to_string();

        let fingerprint_path = dir.path().join("tls").join(FINGERPRINT_FILE);
        std::fs::remove_file(&fingerprint_path).unwrap();

        let reloaded = load_or_generate_identity(dir.path()).unwrap();
        assert_eq!(reloaded.fingerprint(), initial);
        assert_eq!(
            std::fs::read_to_string(&fingerprint_path).unwrap(),
            initial
        );
    }

    #[test]
    fn test_fingerprint_is_lowercase_hex() {
        let fp = cert_fingerprint(b"arbitrary der bytes");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
