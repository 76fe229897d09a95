use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::agent::{AgentOptions, ProxyOptions, TunnelKind};
use crate::error::{PoolError, Result};
use crate::server::{PortRange, ServerPoolConfig};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Front-door proxy configuration
    pub proxy: ProxyServerConfig,
    /// Upstream proxy the tunneling agent dials, if any
    pub upstream: Option<UpstreamProxyConfig>,
    /// Tunneling agent configuration
    pub agent: AgentConfig,
    /// Per-host TLS server pool configuration
    pub servers: ServerPoolConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the front door (default: 8899)
    pub port: u16,
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Socket-idle timeout applied to intercepted connections
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxyConfig {
    pub scheme: UpstreamScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl UpstreamProxyConfig {
    /// `user:pass` credentials for the Proxy-Authorization header
    pub fn proxy_auth(&self) -> Option<String> {
        self.username.as_ref().map(|user| {
            format!("{}:{}", user, self.password.as_deref().unwrap_or(""))
        })
    }

    /// Agent variant for tunneling intercepted HTTPS traffic through this proxy
    pub fn tunnel_kind(&self) -> TunnelKind {
        match self.scheme {
            UpstreamScheme::Http => TunnelKind::HttpsOverHttp,
            UpstreamScheme::Https => TunnelKind::HttpsOverHttps,
        }
    }

    pub fn agent_options(&self, agent: &AgentConfig) -> AgentOptions {
        AgentOptions {
            proxy: ProxyOptions {
                host: self.host.clone(),
                port: self.port,
                proxy_auth: self.proxy_auth(),
                ..ProxyOptions::default()
            },
            max_sockets: agent.max_sockets,
            roots: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Upper bound on live and reserved tunnel sockets
    pub max_sockets: usize,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let servers = ServerPoolConfig {
            max_servers: parse_env_or("SERVER_MAX_COUNT", 220)?,
            liveness_timeout: Duration::from_millis(parse_env_or(
                "SERVER_LIVENESS_TIMEOUT_MS",
                6000,
            )?),
            close_delay: Duration::from_millis(parse_env_or("SERVER_CLOSE_DELAY_MS", 100)?),
            ports: PortRange::new(
                parse_env_or("SERVER_MIN_PORT", 40000)?,
                parse_env_or("SERVER_MAX_PORT", 65000)?,
            )?,
            default_port: parse_env_opt("SERVER_DEFAULT_PORT")?,
            max_bind_attempts: parse_env_opt("SERVER_MAX_BIND_ATTEMPTS")?,
        };

        Ok(Config {
            proxy: ProxyServerConfig {
                port: parse_env_or("PROXY_PORT", 8899)?,
                host: get_env_or("PROXY_HOST", "127.0.0.1"),
                idle_timeout: parse_env_opt::<u64>("SERVER_IDLE_TIMEOUT_MS")?
                    .filter(|ms| *ms > 0)
                    .map(Duration::from_millis),
            },
            upstream: parse_upstream_proxy()?,
            agent: AgentConfig {
                max_sockets: parse_env_or("AGENT_MAX_SOCKETS", usize::MAX)?,
            },
            servers,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the front-door address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}

fn parse_upstream_proxy() -> Result<Option<UpstreamProxyConfig>> {
    let raw = env::var("UPSTREAM_PROXY").unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let url = Url::parse(raw).map_err(|e| {
        PoolError::InvalidConfig(format!("UPSTREAM_PROXY must be a valid URL: {}", e))
    })?;

    if url.fragment().is_some() || url.query().is_some() {
        return Err(PoolError::InvalidConfig(
            "UPSTREAM_PROXY must not include query/fragment".into(),
        ));
    }
    if !(url.path().is_empty() || url.path() == "/") {
        return Err(PoolError::InvalidConfig(
            "UPSTREAM_PROXY must not include a path".into(),
        ));
    }

    let scheme = match url.scheme().to_lowercase().as_str() {
        "http" => UpstreamScheme::Http,
        "https" => UpstreamScheme::Https,
        other => {
            return Err(PoolError::InvalidConfig(format!(
                "UPSTREAM_PROXY has unsupported scheme: {}",
                other
            )))
        }
    };

    let host = url
        .host_str()
        .ok_or_else(|| PoolError::InvalidConfig("UPSTREAM_PROXY must include a host".into()))?;

    // port_or_known_default covers 80/443 for http/https
    let port = url.port_or_known_default().unwrap_or(match scheme {
        UpstreamScheme::Http => 80,
        UpstreamScheme::Https => 443,
    });

    let username = if url.username().is_empty() {
        None
    } else {
        Some(url.username().to_string())
    };
    let password = username
        .as_ref()
        .map(|_| url.password().unwrap_or("").to_string());

    Ok(Some(UpstreamProxyConfig {
        scheme,
        host: host.to_string(),
        port,
        username,
        password,
    }))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    Ok(parse_env_opt(key)?.unwrap_or(default))
}

fn parse_env_opt<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PoolError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))),
        _ => Ok(None),
    }
}
