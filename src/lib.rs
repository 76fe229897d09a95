//! tunnelpool - connection management for a TLS-intercepting proxy
//!
//! ## Features
//!
//! - CONNECT tunneling through an upstream HTTP(S) proxy with socket pooling
//!   and destination affinity
//! - Per-hostname HTTPS listeners with shared creation, liveness guards and
//!   capacity eviction
//! - Port allocation with wraparound and bind retry
//! - Ephemeral CA for per-host certificates

pub mod agent;
pub mod cert;
pub mod config;
pub mod error;
pub mod proxy;
pub mod server;
pub mod tls;

pub use agent::{AgentOptions, PooledSocket, ProxyOptions, Target, TunnelKind, TunnelingAgent};
pub use cert::{Certificate, CertificateIssuer, EphemeralCa};
pub use config::Config;
pub use error::{PoolError, Result};
pub use server::{ConnectionHandler, PortAllocator, PortRange, ServerPool, ServerPoolConfig};
