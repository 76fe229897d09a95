//! TLS material handling
//!
//! Builds rustls server configs for pooled listeners and client configs for
//! tunneled payloads and HTTPS upstream proxies.

use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::cert::Certificate;
use crate::error::{PoolError, Result};

/// Client-side TLS credentials supplied with a tunnel target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// SNI / verification name; defaults to the target host
    pub servername: Option<String>,
    /// PEM client certificate chain
    pub cert: Option<String>,
    /// PEM client private key
    pub key: Option<String>,
    /// PKCS#12 bundle (not supported by rustls)
    pub pfx: Option<Vec<u8>>,
    /// Key passphrase (not supported by rustls)
    pub passphrase: Option<String>,
}

impl TlsOptions {
    fn has_client_auth(&self) -> bool {
        self.cert.is_some() || self.key.is_some()
    }
}

/// Parse a PEM certificate chain
pub fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let chain = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| PoolError::Tls(format!("Failed to parse certificate PEM: {}", e)))?;

    if chain.is_empty() {
        return Err(PoolError::Tls("No certificates found in PEM".into()));
    }
    Ok(chain)
}

/// Parse the first PEM private key
pub fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| PoolError::Tls(format!("Failed to parse private key PEM: {}", e)))?
        .ok_or_else(|| PoolError::Tls("No private key found in PEM".into()))
}

/// Build an acceptor that presents `cert` to every client
///
/// ALPN is pinned to HTTP/1.1 since decrypted traffic is served by an
/// HTTP/1 connection handler.
pub fn acceptor_for(cert: &Certificate) -> Result<TlsAcceptor> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(parse_certs(&cert.cert)?, parse_key(&cert.key)?)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load the platform trust store
pub fn native_roots() -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();

    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }
    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        return Err(PoolError::Tls("No system root certificates found".into()));
    }
    debug!("Loaded {} root certificates", root_store.len());
    Ok(root_store)
}

/// Build a connector trusting `roots`, presenting a client certificate when
/// `options` carries one
pub fn connector_for(roots: Arc<RootCertStore>, options: &TlsOptions) -> Result<TlsConnector> {
    if options.pfx.is_some() {
        return Err(PoolError::UnsupportedCredential("pfx"));
    }
    if options.passphrase.is_some() {
        return Err(PoolError::UnsupportedCredential("passphrase"));
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = if options.has_client_auth() {
        let (Some(cert), Some(key)) = (&options.cert, &options.key) else {
            return Err(PoolError::Tls(
                "client certificate and key must be supplied together".into(),
            ));
        };
        builder.with_client_auth_cert(parse_certs(cert)?, parse_key(key)?)?
    } else {
        builder.with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a host string to a ServerName for TLS connection
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| PoolError::Tls(format!("Invalid server name: {}", host)))
}
