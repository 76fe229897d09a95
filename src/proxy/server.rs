//! Front-door proxy server
//!
//! Accepts client CONNECT requests, provisions the hostname's pooled HTTPS
//! listener and relays the tunnel to it.

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::config::ProxyServerConfig;
use crate::error::{PoolError, Result};
use crate::proxy::forward::{error_response, ForwardHandler, TunnelRoutes, Upstream};
use crate::proxy::tunnel::{parse_authority, relay};
use crate::server::ServerPool;

struct FrontDoor {
    pool: ServerPool,
    upstream: Arc<Upstream>,
    routes: Arc<TunnelRoutes>,
    idle_timeout: Option<Duration>,
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    front: Arc<FrontDoor>,
}

impl ProxyServer {
    pub fn new(config: ProxyServerConfig, pool: ServerPool, upstream: Upstream) -> Self {
        let front = Arc::new(FrontDoor {
            pool,
            upstream: Arc::new(upstream),
            routes: TunnelRoutes::new(),
            idle_timeout: config.idle_timeout,
        });
        Self { config, front }
    }

    /// Bind the configured address and run until `shutdown` flips to true
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| PoolError::InvalidConfig(format!("Invalid proxy address: {}", e)))?;

        let listener = TcpListener::bind(addr).await?;
        info!("Proxy server listening on {}", addr);
        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let front = self.front.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, front).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        front: Arc<FrontDoor>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let front = front.clone();
            async move {
                let response = if req.method() == Method::CONNECT {
                    match front.handle_connect(req, client_addr).await {
                        Ok(response) => response,
                        Err(e) => {
                            debug!("CONNECT failed: {}", e);
                            error_response(e.status_code(), &e.to_string())
                        }
                    }
                } else {
                    error_response(
                        StatusCode::NOT_IMPLEMENTED,
                        "Only CONNECT requests are supported",
                    )
                };
                Ok::<_, Infallible>(response)
            }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await?;

        Ok(())
    }
}

impl FrontDoor {
    #[instrument(skip(self, req), fields(uri = %req.uri()))]
    async fn handle_connect(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>> {
        let uri = req.uri().clone();
        let authority = uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| uri.to_string());
        let (host, port) = parse_authority(&authority)?;
        debug!("CONNECT request to {}:{} from {}", host, port, client_addr);

        let handler = Arc::new(ForwardHandler::new(
            host.clone(),
            self.routes.clone(),
            self.upstream.clone(),
        ));
        let local_port = self
            .pool
            .create_server(&host, handler, self.idle_timeout)
            .await?;

        let on_upgrade: OnUpgrade = hyper::upgrade::on(req);
        let routes = self.routes.clone();
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    debug!("CONNECT upgrade failed: {}", e);
                    return;
                }
            };
            let local = match TcpStream::connect((Ipv4Addr::LOCALHOST, local_port)).await {
                Ok(local) => local,
                Err(e) => {
                    debug!(%host, local_port, "Local listener unreachable: {}", e);
                    return;
                }
            };
            // Registered before the relay sends the client's first byte
            let _route = match local.local_addr() {
                Ok(addr) => routes.register(addr, port),
                Err(e) => {
                    debug!(%host, local_port, "Relay address unavailable: {}", e);
                    return;
                }
            };
            relay(TokioIo::new(upgraded), local).await;
        });

        Ok(Response::new(Full::new(Bytes::new())))
    }
}
