//! Front-door proxy
//!
//! This module provides:
//! - The CONNECT front door that hands each hostname to the server pool
//! - Byte relay between client tunnels and pooled listeners
//! - Forwarding of decrypted requests, directly or through the tunneling agent

pub mod forward;
pub mod server;
pub mod tunnel;

pub use forward::{ForwardHandler, RouteGuard, TunnelRoutes, Upstream};
pub use server::ProxyServer;
pub use tunnel::{parse_authority, relay};
