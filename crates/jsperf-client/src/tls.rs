//! Client TLS setup: trust the given CA (or self-signed server cert) and
//! offer only `h2`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse PEM: {0}")]
    Pem(#[source] io::Error),
    #[error("no certificates found")]
    NoCertificates,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

pub fn load_client_config(ca: &Path) -> Result<Arc<ClientConfig>, TlsError> {
    let pem = std::fs::read(ca).map_err(|source| TlsError::Read {
        path: ca.to_path_buf(),
        source,
    })?;
    client_config_from_pem(&pem)
}

pub fn client_config_from_pem(ca_pem: &[u8]) -> Result<Arc<ClientConfig>, TlsError> {
    let mut roots = RootCertStore::empty();
    let mut found = false;
    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        roots.add(cert.map_err(TlsError::Pem)?)?;
        found = true;
    }
    if !found {
        return Err(TlsError::NoCertificates);
    }

    let mut config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Arc::new(config))
}
