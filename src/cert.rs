//! Certificate issuance capability consumed by the server pool
//!
//! The pool only needs `create_certificate(hostname) -> {key, cert}`.
//! `EphemeralCa` is an in-memory CA that signs a fresh leaf per hostname.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose,
};
use rustls::RootCertStore;
use rustls_pki_types::CertificateDer;
use tracing::{debug, info};

use crate::error::{PoolError, Result};

/// PEM-encoded key and certificate issued for one hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub key: String,
    pub cert: String,
}

/// Issues a certificate for a hostname
pub trait CertificateIssuer: Send + Sync {
    fn create_certificate(&self, hostname: &str) -> Result<Certificate>;
}

impl<F> CertificateIssuer for F
where
    F: Fn(&str) -> Result<Certificate> + Send + Sync,
{
    fn create_certificate(&self, hostname: &str) -> Result<Certificate> {
        self(hostname)
    }
}

/// In-memory certificate authority
pub struct EphemeralCa {
    ca_key: KeyPair,
    ca_params: CertificateParams,
    ca_cert_pem: String,
    ca_cert_der: CertificateDer<'static>,
}

impl EphemeralCa {
    /// Generate a new self-signed CA
    pub fn generate() -> Result<Self> {
        info!("Generating ephemeral CA certificate");

        let ca_key = KeyPair::generate().map_err(|e| ca_error("CA", e))?;

        let mut ca_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("tunnelpool Ephemeral CA".to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("tunnelpool".to_string()),
        );
        ca_params.distinguished_name = dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| ca_error("CA", e))?;

        Ok(Self {
            ca_cert_pem: ca_cert.pem(),
            ca_cert_der: ca_cert.der().clone(),
            ca_key,
            ca_params,
        })
    }

    /// CA certificate as PEM, for installing into client trust stores
    pub fn cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Trust store containing only this CA
    pub fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert_der.clone())?;
        Ok(roots)
    }
}

impl CertificateIssuer for EphemeralCa {
    fn create_certificate(&self, hostname: &str) -> Result<Certificate> {
        debug!("Issuing certificate for {}", hostname);

        let key = KeyPair::generate().map_err(|e| ca_error(hostname, e))?;

        // IP literals become IP SANs, everything else a DNS SAN
        let mut params =
            CertificateParams::new(vec![hostname.to_string()]).map_err(|e| ca_error(hostname, e))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(hostname.to_string()));
        params.distinguished_name = dn;

        let issuer = Issuer::from_params(&self.ca_params, &self.ca_key);
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| ca_error(hostname, e))?;

        Ok(Certificate {
            key: key.serialize_pem(),
            cert: cert.pem(),
        })
    }
}

fn ca_error(hostname: &str, err: rcgen::Error) -> PoolError {
    PoolError::Certificate {
        hostname: hostname.to_string(),
        reason: err.to_string(),
    }
}
