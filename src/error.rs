use std::io;

use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for tunnelpool
#[derive(Error, Debug)]
pub enum PoolError {
    // Tunnel errors
    #[error("tunneling socket could not be established, statusCode={status}")]
    TunnelRejected { status: u16 },

    #[error("tunneling socket could not be established, cause={0}")]
    TunnelFailed(String),

    // TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Unsupported TLS credential: {0}")]
    UnsupportedCredential(&'static str),

    // Server pool errors
    #[error("Certificate issuance failed for {hostname}: {reason}")]
    Certificate { hostname: String, reason: String },

    #[error("Server for {hostname} is unavailable: {reason}")]
    ServerUnavailable { hostname: String, reason: String },

    #[error("No bindable port in {min}-{max} after {attempts} attempts")]
    PortsExhausted { min: u16, max: u16, attempts: u32 },

    #[error("Listener already closed")]
    ListenerClosed,

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for tunnelpool operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// I/O error kind an HTTP client stack should see for this error
    ///
    /// Tunnel establishment failures always surface as a connection reset.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            PoolError::TunnelRejected { .. } | PoolError::TunnelFailed(_) => {
                io::ErrorKind::ConnectionReset
            }
            PoolError::Io(e) => e.kind(),
            PoolError::PortsExhausted { .. } => io::ErrorKind::AddrInUse,
            PoolError::InvalidRequest(_)
            | PoolError::InvalidConfig(_)
            | PoolError::UnsupportedCredential(_) => io::ErrorKind::InvalidInput,
            PoolError::ListenerClosed => io::ErrorKind::NotConnected,
            _ => io::ErrorKind::Other,
        }
    }

    /// Check if this error came from establishing a CONNECT tunnel
    pub fn is_tunnel_error(&self) -> bool {
        matches!(
            self,
            PoolError::TunnelRejected { .. } | PoolError::TunnelFailed(_)
        )
    }

    /// Get the HTTP status code the front door answers with
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            PoolError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 502 Bad Gateway
            PoolError::TunnelRejected { .. }
            | PoolError::TunnelFailed(_)
            | PoolError::Tls(_)
            | PoolError::Http(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            PoolError::ServerUnavailable { .. }
            | PoolError::PortsExhausted { .. }
            | PoolError::ListenerClosed => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            PoolError::UnsupportedCredential(_)
            | PoolError::Certificate { .. }
            | PoolError::InvalidConfig(_)
            | PoolError::Io(_)
            | PoolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PoolError> for io::Error {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Io(e) => e,
            other => io::Error::new(other.kind(), other),
        }
    }
}

// Convert from hyper errors
impl From<hyper::Error> for PoolError {
    fn from(err: hyper::Error) -> Self {
        PoolError::Http(err.to_string())
    }
}

impl From<http::Error> for PoolError {
    fn from(err: http::Error) -> Self {
        PoolError::InvalidRequest(err.to_string())
    }
}

impl From<rustls::Error> for PoolError {
    fn from(err: rustls::Error) -> Self {
        PoolError::Tls(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for PoolError {
    fn from(err: url::ParseError) -> Self {
        PoolError::InvalidConfig(err.to_string())
    }
}
