//! CONNECT handshake against the upstream proxy

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use super::socket::TunnelStream;
use super::{ProxyOptions, TunnelKind};
use crate::error::{PoolError, Result};
use crate::tls::{self, TlsOptions};

/// Dials the upstream proxy and opens tunnels through it
pub(crate) struct Connector {
    kind: TunnelKind,
    proxy: ProxyOptions,
    roots: Option<Arc<RootCertStore>>,
    proxy_tls: Option<TlsConnector>,
}

impl Connector {
    pub(crate) fn new(
        kind: TunnelKind,
        proxy: ProxyOptions,
        roots: Option<Arc<RootCertStore>>,
    ) -> Result<Self> {
        let roots = match roots {
            Some(roots) => Some(roots),
            None if kind.proxy_tls() || kind.payload_tls() => Some(Arc::new(tls::native_roots()?)),
            None => None,
        };

        let proxy_tls = match (&roots, kind.proxy_tls()) {
            (Some(roots), true) => Some(tls::connector_for(roots.clone(), &TlsOptions::default())?),
            _ => None,
        };

        Ok(Self {
            kind,
            proxy,
            roots,
            proxy_tls,
        })
    }

    /// Open a tunnel to `host:port`, wrapping it in TLS for HTTPS payloads
    #[instrument(skip(self, options), fields(proxy = %format_connect_authority(&self.proxy.host, self.proxy.port)))]
    pub(crate) async fn establish(
        &self,
        host: &str,
        port: u16,
        options: &TlsOptions,
    ) -> Result<TunnelStream> {
        let io = TokioIo::new(self.open_tunnel(host, port).await?);
        debug!("Tunnel established");

        let Some(roots) = self.roots.clone().filter(|_| self.kind.payload_tls()) else {
            return Ok(TunnelStream::Plain(io));
        };

        let connector = tls::connector_for(roots, options)?;
        let name = tls::server_name(options.servername.as_deref().unwrap_or(host))?;
        let stream = connector
            .connect(name, io)
            .await
            .map_err(|e| PoolError::Tls(format!("handshake with {} failed: {}", host, e)))?;
        Ok(TunnelStream::Tls(Box::new(stream)))
    }

    async fn open_tunnel(&self, host: &str, port: u16) -> Result<Upgraded> {
        let proxy_addr = format_connect_authority(&self.proxy.host, self.proxy.port);
        let tcp = TcpStream::connect(&proxy_addr).await.map_err(tunnel_failed)?;
        let _ = tcp.set_nodelay(true);

        match &self.proxy_tls {
            Some(connector) => {
                let name = self.proxy.servername.as_deref().unwrap_or(&self.proxy.host);
                let stream = connector
                    .connect(tls::server_name(name)?, tcp)
                    .await
                    .map_err(tunnel_failed)?;
                self.send_connect(stream, host, port).await
            }
            None => self.send_connect(tcp, host, port).await,
        }
    }

    async fn send_connect<IO>(&self, io: IO, host: &str, port: u16) -> Result<Upgraded>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(tunnel_failed)?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("CONNECT connection error: {}", e);
            }
        });

        let response = sender
            .send_request(self.connect_request(host, port)?)
            .await
            .map_err(tunnel_failed)?;

        if response.status() != StatusCode::OK {
            return Err(PoolError::TunnelRejected {
                status: response.status().as_u16(),
            });
        }

        hyper::upgrade::on(response).await.map_err(tunnel_failed)
    }

    fn connect_request(&self, host: &str, port: u16) -> Result<Request<Empty<Bytes>>> {
        let authority = format_connect_authority(host, port);
        let mut request = Request::builder()
            .method(Method::CONNECT)
            .uri(authority.as_str())
            .header(HOST, authority.as_str())
            .body(Empty::<Bytes>::new())?;

        let headers = request.headers_mut();
        for (name, value) in &self.proxy.headers {
            headers.append(name.clone(), value.clone());
        }
        if let Some(auth) = &self.proxy.proxy_auth {
            let value = HeaderValue::from_str(&format!("Basic {}", BASE64.encode(auth)))
                .map_err(|e| PoolError::InvalidConfig(format!("proxy credentials: {}", e)))?;
            headers.insert(PROXY_AUTHORIZATION, value);
        }

        Ok(request)
    }
}

fn tunnel_failed(cause: impl std::fmt::Display) -> PoolError {
    PoolError::TunnelFailed(cause.to_string())
}

pub(crate) fn format_connect_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_connect_authority_brackets_ipv6() {
        assert_eq!(format_connect_authority("example.com", 443), "example.com:443");
        assert_eq!(format_connect_authority("127.0.0.1", 80), "127.0.0.1:80");
        assert_eq!(format_connect_authority("::1", 443), "[::1]:443");
        assert_eq!(format_connect_authority("[::1]", 443), "[::1]:443");
    }

    #[test]
    fn test_connect_request_carries_credentials_and_extra_headers() {
        let mut proxy = ProxyOptions {
            host: "proxy.local".to_string(),
            port: 3128,
            proxy_auth: Some("user:pass".to_string()),
            ..ProxyOptions::default()
        };
        proxy
            .headers
            .insert("x-tunnel-id", HeaderValue::from_static("42"));
        proxy.headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_static("Basic overridden"),
        );
        let connector = Connector::new(TunnelKind::HttpOverHttp, proxy, None).unwrap();

        let request = connector.connect_request("example.com", 443).unwrap();
        assert_eq!(request.method(), Method::CONNECT);
        assert_eq!(request.uri().to_string(), "example.com:443");
        assert_eq!(request.headers()[HOST], "example.com:443");
        assert_eq!(request.headers()["x-tunnel-id"], "42");
        assert_eq!(
            request.headers().get_all(PROXY_AUTHORIZATION).iter().count(),
            1
        );
        assert_eq!(
            request.headers()[PROXY_AUTHORIZATION],
            "Basic dXNlcjpwYXNz"
        );
    }

    #[test]
    fn test_connect_request_without_credentials() {
        let proxy = ProxyOptions {
            host: "proxy.local".to_string(),
            port: 3128,
            ..ProxyOptions::default()
        };
        let connector = Connector::new(TunnelKind::HttpOverHttp, proxy, None).unwrap();
        let request = connector.connect_request("::1", 8443).unwrap();
        assert_eq!(request.uri().to_string(), "[::1]:8443");
        assert!(request.headers().get(PROXY_AUTHORIZATION).is_none());
    }
}
