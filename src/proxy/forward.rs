//! Forwarding of decrypted requests to the real origin

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use crate::agent::{Target, TunnelingAgent};
use crate::error::{PoolError, Result};
use crate::server::{ConnectionHandler, SecureStream};
use crate::tls;

/// Where decrypted requests are sent
pub enum Upstream {
    /// Through CONNECT tunnels to the upstream proxy
    Tunnel(TunnelingAgent),
    /// Straight to the origin over TLS
    Direct(TlsConnector),
}

impl Upstream {
    #[instrument(skip(self, request), fields(method = %request.method(), path = %request.uri().path()))]
    async fn forward(
        &self,
        host: &str,
        port: u16,
        request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let request = outbound_request(host, port, request).await?;

        match self {
            Upstream::Tunnel(agent) => {
                let socket = agent
                    .add_request(Target::new(host).with_port(port))
                    .await?;
                let (response, socket) = exchange(socket, request).await?;
                if let Some(socket) = socket {
                    socket.free();
                }
                Ok(response)
            }
            Upstream::Direct(connector) => {
                let stream = TcpStream::connect((host, port)).await?;
                let stream = connector
                    .connect(tls::server_name(host)?, stream)
                    .await
                    .map_err(|e| PoolError::Tls(format!("handshake with {} failed: {}", host, e)))?;
                let (response, _) = exchange(stream, request).await?;
                Ok(response)
            }
        }
    }
}

/// Origin port used for connections that did not arrive through a relay
const DEFAULT_ORIGIN_PORT: u16 = 443;

/// CONNECT ports of live relays, keyed by the local address each relay
/// dials its pooled listener from
///
/// One listener serves every port of a hostname, so the port travels with
/// the connection rather than with the listener.
#[derive(Debug, Default)]
pub struct TunnelRoutes {
    ports: Mutex<HashMap<SocketAddr, u16>>,
}

impl TunnelRoutes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route connections from `local` to `port` until the guard drops
    pub fn register(self: &Arc<Self>, local: SocketAddr, port: u16) -> RouteGuard {
        self.ports.lock().insert(local, port);
        RouteGuard {
            routes: self.clone(),
            local,
        }
    }

    pub fn port_for(&self, peer: &SocketAddr) -> Option<u16> {
        self.ports.lock().get(peer).copied()
    }

    pub fn len(&self) -> usize {
        self.ports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.lock().is_empty()
    }
}

/// Removes its route when dropped
pub struct RouteGuard {
    routes: Arc<TunnelRoutes>,
    local: SocketAddr,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.routes.ports.lock().remove(&self.local);
    }
}

/// Serves decrypted HTTP/1.1 on a pooled listener, forwarding every request
/// to `host` on the port its relay was opened for
pub struct ForwardHandler {
    host: String,
    routes: Arc<TunnelRoutes>,
    upstream: Arc<Upstream>,
}

impl ForwardHandler {
    pub fn new(
        host: impl Into<String>,
        routes: Arc<TunnelRoutes>,
        upstream: Arc<Upstream>,
    ) -> Self {
        Self {
            host: host.into(),
            routes,
            upstream,
        }
    }
}

#[async_trait]
impl ConnectionHandler for ForwardHandler {
    async fn handle(&self, stream: SecureStream, peer: SocketAddr) {
        let host = self.host.clone();
        let port = self.routes.port_for(&peer).unwrap_or(DEFAULT_ORIGIN_PORT);
        let upstream = self.upstream.clone();

        let service = service_fn(move |req: Request<Incoming>| {
            let host = host.clone();
            let upstream = upstream.clone();
            async move {
                let response = match upstream.forward(&host, port, req).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(%host, "Forwarding failed: {}", e);
                        error_response(e.status_code(), &e.to_string())
                    }
                };
                Ok::<_, Infallible>(response)
            }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            debug!(%peer, "Decrypted connection ended: {}", e);
        }
    }
}

async fn outbound_request(
    host: &str,
    port: u16,
    request: Request<Incoming>,
) -> Result<Request<Full<Bytes>>> {
    let (parts, body) = request.into_parts();
    let body = body.collect().await?.to_bytes();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = Request::builder().method(parts.method.clone()).uri(path);
    for (name, value) in &parts.headers {
        if !is_hop_by_hop_header(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    if !parts.headers.contains_key(HOST) {
        let authority = if port == 443 {
            host.to_string()
        } else {
            format!("{}:{}", host, port)
        };
        builder = builder.header(HOST, authority);
    }

    Ok(builder.body(Full::new(body))?)
}

/// Send one request over `io` and hand `io` back when it can carry another
async fn exchange<IO>(
    io: IO,
    request: Request<Full<Bytes>>,
) -> Result<(Response<Full<Bytes>>, Option<IO>)>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    let conn = tokio::spawn(conn.without_shutdown());

    let response = sender.send_request(request).await?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();
    drop(sender);

    let reusable = !wants_close(&parts.headers);
    let io = match conn.await {
        Ok(Ok(io_parts)) if reusable && io_parts.read_buf.is_empty() => {
            Some(io_parts.io.into_inner())
        }
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            debug!("Upstream connection error: {}", e);
            None
        }
        Err(e) => {
            debug!("Upstream connection task failed: {}", e);
            None
        }
    };

    Ok((Response::from_parts(parts, Full::new(body)), io))
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("close"))
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
