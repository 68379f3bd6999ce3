//! TLS termination: PEM loading and development certificates.

use gatehouse_core::GateError;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Names a development certificate is valid for.
const DEV_CERT_NAMES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed PEM: {0}")]
    Pem(std::io::Error),

    #[error("no private key found in {}", .0.display())]
    NoKey(PathBuf),

    #[error("invalid TLS config: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("cannot write certificate: {0}")]
    Write(#[from] std::io::Error),
}

impl From<TlsError> for GateError {
    fn from(e: TlsError) -> Self {
        GateError::Config(e.to_string())
    }
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Build a rustls server config from a PEM certificate chain and key.
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<rustls::ServerConfig, TlsError> {
    let cert_pem = read(cert_path)?;
    let key_pem = read(key_path)?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Pem)?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(TlsError::Pem)?
        .ok_or_else(|| TlsError::NoKey(key_path.to_path_buf()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    // WebSocket upgrades only.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Write a fresh self-signed certificate and key into `dir` and return
/// their paths.
pub fn generate_dev_cert(dir: &Path) -> Result<(PathBuf, PathBuf), TlsError> {
    std::fs::create_dir_all(dir)?;

    let mut params =
        rcgen::CertificateParams::new(DEV_CERT_NAMES.iter().map(|n| n.to_string()).collect::<Vec<_>>())?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "gatehouse dev cert");
    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;
    Ok((cert_path, key_path))
}
