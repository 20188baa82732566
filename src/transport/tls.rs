use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::service::{WireError, WireResult};

fn load_certs(path: &Path) -> WireResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(WireError::Io)
}

fn load_key(path: &Path) -> WireResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| WireError::Tls(format!("no private key found in {}", path.display())))
}

/// Server-side handshake capability from PEM cert chain and key files.
pub(crate) fn acceptor(cert: &Path, key: &Path) -> WireResult<TlsAcceptor> {
    let certs = load_certs(cert)?;
    let key = load_key(key)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| WireError::Tls(err.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client-side handshake capability trusting the given PEM CA bundle.
pub(crate) fn connector(ca: &Path) -> WireResult<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots
            .add(cert)
            .map_err(|err| WireError::Tls(err.to_string()))?;
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}
