//! Tunneling agent
//!
//! Opens CONNECT tunnels through an upstream HTTP(S) proxy on behalf of an
//! HTTP client stack. Tunnels count against `max_sockets` from the moment a
//! request is accepted; requests over the limit wait in a FIFO queue and are
//! served when a slot is released or when a freed socket matches their
//! destination.

mod connect;
mod socket;

pub use socket::{PooledSocket, TunnelStream};

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use hyper::HeaderMap;
use parking_lot::Mutex;
use rustls::RootCertStore;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{PoolError, Result};
use crate::tls::TlsOptions;
use connect::Connector;
use socket::Lease;

/// Tunnel transport × payload combination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    /// Plain CONNECT, plain payload
    HttpOverHttp,
    /// Plain CONNECT, TLS payload
    HttpsOverHttp,
    /// CONNECT over TLS to the proxy, plain payload
    HttpOverHttps,
    /// CONNECT over TLS to the proxy, TLS payload
    HttpsOverHttps,
}

impl TunnelKind {
    /// Whether the proxy itself is reached over TLS
    pub fn proxy_tls(self) -> bool {
        matches!(self, TunnelKind::HttpOverHttps | TunnelKind::HttpsOverHttps)
    }

    /// Whether the tunneled socket is wrapped in TLS
    pub fn payload_tls(self) -> bool {
        matches!(self, TunnelKind::HttpsOverHttp | TunnelKind::HttpsOverHttps)
    }

    pub fn default_port(self) -> u16 {
        if self.payload_tls() {
            443
        } else {
            80
        }
    }
}

/// Upstream proxy the CONNECT requests are sent to
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    /// `user:pass`, sent as `Proxy-Authorization: Basic ...`
    pub proxy_auth: Option<String>,
    /// Extra headers added to every CONNECT request
    pub headers: HeaderMap,
    /// TLS name for HTTPS proxies; defaults to `host`
    pub servername: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub proxy: ProxyOptions,
    /// Concurrent tunnels, counting those still being established
    pub max_sockets: usize,
    /// Trust anchors for TLS legs; the platform store when `None`
    pub roots: Option<Arc<RootCertStore>>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            proxy: ProxyOptions::default(),
            max_sockets: usize::MAX,
            roots: None,
        }
    }
}

/// Destination of a tunnel request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    /// Agent default port when `None`
    pub port: Option<u16>,
    /// Request path; carried for the caller, not used by the tunnel
    pub path: Option<String>,
    /// Client credentials for the tunneled TLS handshake
    pub tls: TlsOptions,
}

impl Target {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }
}

impl From<(&str, u16)> for Target {
    fn from((host, port): (&str, u16)) -> Self {
        Target::new(host).with_port(port)
    }
}

/// Positional `(host, port, path)` form
impl From<(&str, u16, &str)> for Target {
    fn from((host, port, path): (&str, u16, &str)) -> Self {
        Self {
            path: Some(path.to_string()),
            ..Target::new(host).with_port(port)
        }
    }
}

pub(crate) struct PendingRequest {
    host: String,
    port: u16,
    tls: TlsOptions,
    pub(crate) reply: oneshot::Sender<Result<PooledSocket>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Reserved while the CONNECT is in flight
    Placeholder,
    Connected,
}

struct Slot {
    id: u64,
    state: SlotState,
}

#[derive(Default)]
struct AgentState {
    sockets: Vec<Slot>,
    requests: VecDeque<PendingRequest>,
    next_slot: u64,
}

impl AgentState {
    fn reserve(&mut self) -> u64 {
        self.next_slot += 1;
        self.sockets.push(Slot {
            id: self.next_slot,
            state: SlotState::Placeholder,
        });
        self.next_slot
    }

    /// Oldest queued request whose caller is still waiting
    fn next_request(&mut self) -> Option<PendingRequest> {
        while let Some(request) = self.requests.pop_front() {
            if !request.reply.is_closed() {
                return Some(request);
            }
        }
        None
    }
}

pub(crate) struct AgentInner {
    kind: TunnelKind,
    max_sockets: usize,
    connector: Connector,
    state: Mutex<AgentState>,
}

/// Pools CONNECT tunnels through one upstream proxy
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct TunnelingAgent {
    inner: Arc<AgentInner>,
}

impl TunnelingAgent {
    pub fn new(kind: TunnelKind, options: AgentOptions) -> Result<Self> {
        if options.max_sockets == 0 {
            return Err(PoolError::InvalidConfig(
                "max_sockets must be at least 1".into(),
            ));
        }
        if options.proxy.host.is_empty() {
            return Err(PoolError::InvalidConfig("proxy host is required".into()));
        }

        let connector = Connector::new(kind, options.proxy, options.roots)?;
        Ok(Self {
            inner: Arc::new(AgentInner {
                kind,
                max_sockets: options.max_sockets,
                connector,
                state: Mutex::new(AgentState::default()),
            }),
        })
    }

    pub fn http_over_http(options: AgentOptions) -> Result<Self> {
        Self::new(TunnelKind::HttpOverHttp, options)
    }

    pub fn https_over_http(options: AgentOptions) -> Result<Self> {
        Self::new(TunnelKind::HttpsOverHttp, options)
    }

    pub fn http_over_https(options: AgentOptions) -> Result<Self> {
        Self::new(TunnelKind::HttpOverHttps, options)
    }

    pub fn https_over_https(options: AgentOptions) -> Result<Self> {
        Self::new(TunnelKind::HttpsOverHttps, options)
    }

    pub fn kind(&self) -> TunnelKind {
        self.inner.kind
    }

    pub fn default_port(&self) -> u16 {
        self.inner.kind.default_port()
    }

    pub fn max_sockets(&self) -> usize {
        self.inner.max_sockets
    }

    /// Slots in use, including tunnels still being established
    pub fn socket_count(&self) -> usize {
        self.inner.state.lock().sockets.len()
    }

    /// Established tunnels
    pub fn connected_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .sockets
            .iter()
            .filter(|slot| slot.state == SlotState::Connected)
            .count()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().requests.len()
    }

    /// Request a tunnel to `target`
    ///
    /// The slot is reserved, or the request queued, before this returns.
    /// Establishment failures resolve to an error whose `kind()` is
    /// `ConnectionReset`; nothing is retried.
    pub fn add_request(
        &self,
        target: impl Into<Target>,
    ) -> impl Future<Output = Result<PooledSocket>> + Send + 'static {
        let target = target.into();
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest {
            port: target.port.unwrap_or_else(|| self.default_port()),
            host: target.host,
            tls: target.tls,
            reply: tx,
        };

        let reserved = {
            let mut state = self.inner.state.lock();
            if state.sockets.len() >= self.inner.max_sockets {
                debug!(
                    host = %request.host,
                    port = request.port,
                    queued = state.requests.len() + 1,
                    "Socket limit reached, queueing request"
                );
                state.requests.push_back(request);
                None
            } else {
                Some((state.reserve(), request))
            }
        };
        if let Some((slot, request)) = reserved {
            self.inner.create_connection(slot, request);
        }

        async move {
            rx.await.map_err(|_| {
                PoolError::TunnelFailed("agent dropped the request".to_string())
            })?
        }
    }
}

impl AgentInner {
    fn create_connection(self: &Arc<Self>, slot: u64, request: PendingRequest) {
        let agent = self.clone();
        tokio::spawn(async move {
            let PendingRequest {
                host,
                port,
                tls,
                reply,
            } = request;

            match agent.connector.establish(&host, port, &tls).await {
                Ok(stream) => {
                    agent.mark_connected(slot);
                    let lease = Lease {
                        slot,
                        host,
                        port,
                        agent: Arc::downgrade(&agent),
                    };
                    // A caller that gave up drops the socket, releasing the slot
                    let _ = reply.send(Ok(PooledSocket::new(stream, lease)));
                }
                Err(e) => {
                    warn!(%host, port, "Tunnel establishment failed: {}", e);
                    agent.remove_socket(slot);
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    fn mark_connected(&self, slot: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.sockets.iter_mut().find(|s| s.id == slot) {
            entry.state = SlotState::Connected;
        }
    }

    /// Dequeue the first request for `host:port`
    pub(crate) fn take_matching(&self, host: &str, port: u16) -> Option<PendingRequest> {
        let mut state = self.state.lock();
        state.requests.retain(|request| !request.reply.is_closed());
        let pos = state
            .requests
            .iter()
            .position(|request| request.host == host && request.port == port)?;
        state.requests.remove(pos)
    }

    /// Vacate `slot` and promote the oldest queued request into it
    pub(crate) fn remove_socket(self: &Arc<Self>, slot: u64) {
        let next = {
            let mut state = self.state.lock();
            let Some(pos) = state.sockets.iter().position(|s| s.id == slot) else {
                return;
            };
            state.sockets.remove(pos);
            match state.next_request() {
                Some(request) => Some((state.reserve(), request)),
                None => None,
            }
        };

        if let Some((slot, request)) = next {
            debug!(host = %request.host, port = request.port, "Promoting queued request");
            self.create_connection(slot, request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{CertificateIssuer, EphemeralCa};
    use crate::tls;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_rustls::TlsAcceptor;

    #[derive(Clone, Copy)]
    enum Behaviour {
        /// Reply 200 and echo tunneled bytes
        Echo,
        /// Reply 200 and splice the tunnel to this address
        Forward(SocketAddr),
        /// Reply with this status and close
        Reject(u16),
    }

    struct FakeProxy {
        addr: SocketAddr,
        heads: Arc<Mutex<Vec<String>>>,
        connects: Arc<AtomicUsize>,
    }

    impl FakeProxy {
        async fn start(behaviour: Behaviour) -> Self {
            Self::start_with(behaviour, None).await
        }

        /// Proxy that expects TLS from its clients before the CONNECT
        async fn start_tls(behaviour: Behaviour, acceptor: TlsAcceptor) -> Self {
            Self::start_with(behaviour, Some(acceptor)).await
        }

        async fn start_with(behaviour: Behaviour, acceptor: Option<TlsAcceptor>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let heads = Arc::new(Mutex::new(Vec::new()));
            let connects = Arc::new(AtomicUsize::new(0));

            let (h, c) = (heads.clone(), connects.clone());
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    c.fetch_add(1, Ordering::SeqCst);
                    let heads = h.clone();
                    match acceptor.clone() {
                        Some(acceptor) => {
                            tokio::spawn(async move {
                                if let Ok(stream) = acceptor.accept(stream).await {
                                    serve(stream, behaviour, heads).await;
                                }
                            });
                        }
                        None => {
                            tokio::spawn(serve(stream, behaviour, heads));
                        }
                    }
                }
            });

            Self {
                addr,
                heads,
                connects,
            }
        }

        fn options(&self) -> AgentOptions {
            AgentOptions {
                proxy: ProxyOptions {
                    host: self.addr.ip().to_string(),
                    port: self.addr.port(),
                    ..ProxyOptions::default()
                },
                ..AgentOptions::default()
            }
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn request_lines(&self) -> Vec<String> {
            self.heads
                .lock()
                .iter()
                .map(|head| head.lines().next().unwrap_or_default().to_string())
                .collect()
        }
    }

    async fn serve<S>(mut stream: S, behaviour: Behaviour, heads: Arc<Mutex<Vec<String>>>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
        heads.lock().push(String::from_utf8_lossy(&head).into_owned());

        match behaviour {
            Behaviour::Reject(status) => {
                let response = format!("HTTP/1.1 {} Rejected\r\nContent-Length: 0\r\n\r\n", status);
                let _ = stream.write_all(response.as_bytes()).await;
            }
            Behaviour::Echo => {
                if stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                let (mut reader, mut writer) = tokio::io::split(stream);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            }
            Behaviour::Forward(addr) => {
                let Ok(mut upstream) = TcpStream::connect(addr).await else {
                    return;
                };
                if stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
            }
        }
    }

    async fn tls_echo_server(ca: &EphemeralCa, hostname: &str) -> SocketAddr {
        let acceptor = tls::acceptor_for(&ca.create_certificate(hostname).unwrap()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(mut stream) = acceptor.accept(stream).await else {
                        return;
                    };
                    let mut buf = [0u8; 64];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn echo<S: AsyncReadExt + AsyncWriteExt + Unpin>(stream: &mut S, payload: &[u8]) {
        stream.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, payload);
    }

    async fn within<F: Future>(future: F) -> F::Output {
        timeout(Duration::from_secs(3), future)
            .await
            .expect("timed out")
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        within(async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    }

    #[tokio::test]
    async fn test_tunnel_round_trip() {
        let proxy = FakeProxy::start(Behaviour::Echo).await;
        let agent = TunnelingAgent::http_over_http(proxy.options()).unwrap();

        let mut socket = within(agent.add_request(("a.test", 8080))).await.unwrap();
        assert_eq!(socket.target(), ("a.test", 8080));
        assert!(!socket.get_ref().is_tls());
        assert_eq!(agent.socket_count(), 1);
        assert_eq!(agent.connected_count(), 1);

        echo(&mut socket, b"hello through the tunnel").await;
        assert_eq!(proxy.request_lines(), vec!["CONNECT a.test:8080 HTTP/1.1"]);

        drop(socket);
        assert_eq!(agent.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_slot_reserved_before_connect_completes() {
        let proxy = FakeProxy::start(Behaviour::Echo).await;
        let agent = TunnelingAgent::http_over_http(AgentOptions {
            max_sockets: 1,
            ..proxy.options()
        })
        .unwrap();

        let first = agent.add_request(("a.test", 80));
        let second = agent.add_request(("b.test", 80));
        assert_eq!(agent.socket_count(), 1);
        assert_eq!(agent.connected_count(), 0);
        assert_eq!(agent.pending_requests(), 1);

        let first = within(first).await.unwrap();
        assert_eq!(agent.pending_requests(), 1);

        drop(first);
        let second = within(second).await.unwrap();
        assert_eq!(second.target(), ("b.test", 80));
        assert_eq!(agent.pending_requests(), 0);
        assert_eq!(agent.socket_count(), 1);
        assert_eq!(
            proxy.request_lines(),
            vec!["CONNECT a.test:80 HTTP/1.1", "CONNECT b.test:80 HTTP/1.1"]
        );
    }

    #[tokio::test]
    async fn test_free_socket_goes_to_first_queued_request_for_same_origin() {
        let proxy = FakeProxy::start(Behaviour::Echo).await;
        let agent = TunnelingAgent::http_over_http(AgentOptions {
            max_sockets: 1,
            ..proxy.options()
        })
        .unwrap();

        let a = within(agent.add_request(("h1.test", 80))).await.unwrap();
        let b = agent.add_request(("h2.test", 80));
        let c = agent.add_request(("h1.test", 80));
        assert_eq!(agent.pending_requests(), 2);

        a.free();
        let mut c = within(c).await.unwrap();
        assert_eq!(c.target(), ("h1.test", 80));
        assert_eq!(agent.pending_requests(), 1);
        assert_eq!(agent.socket_count(), 1);
        assert_eq!(proxy.connects(), 1, "tunnel reused without a new CONNECT");
        echo(&mut c, b"same tunnel").await;

        drop(c);
        let b = within(b).await.unwrap();
        assert_eq!(b.target(), ("h2.test", 80));
        assert_eq!(proxy.connects(), 2);
    }

    #[tokio::test]
    async fn test_free_without_matching_request_closes_tunnel() {
        let proxy = FakeProxy::start(Behaviour::Echo).await;
        let agent = TunnelingAgent::http_over_http(AgentOptions {
            max_sockets: 1,
            ..proxy.options()
        })
        .unwrap();

        let a = within(agent.add_request(("h1.test", 80))).await.unwrap();
        let b = agent.add_request(("h2.test", 80));

        a.free();
        // No match: the slot is released and the queue head promoted
        let b = within(b).await.unwrap();
        assert_eq!(b.target(), ("h2.test", 80));
        assert_eq!(proxy.connects(), 2);

        b.free();
        assert_eq!(agent.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_connect_is_connection_reset() {
        let proxy = FakeProxy::start(Behaviour::Reject(407)).await;
        let agent = TunnelingAgent::http_over_http(AgentOptions {
            max_sockets: 1,
            ..proxy.options()
        })
        .unwrap();

        let first = agent.add_request(("a.test", 80));
        let second = agent.add_request(("b.test", 80));

        let err = within(first).await.err().unwrap();
        assert!(matches!(err, PoolError::TunnelRejected { status: 407 }));
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(
            err.to_string(),
            "tunneling socket could not be established, statusCode=407"
        );

        // The released slot was handed to the queued request
        let err = within(second).await.err().unwrap();
        assert!(matches!(err, PoolError::TunnelRejected { status: 407 }));
        assert_eq!(agent.socket_count(), 0);
        assert_eq!(agent.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_connection_reset() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let agent = TunnelingAgent::http_over_http(AgentOptions {
            proxy: ProxyOptions {
                host: addr.ip().to_string(),
                port: addr.port(),
                ..ProxyOptions::default()
            },
            ..AgentOptions::default()
        })
        .unwrap();

        let err = within(agent.add_request(("a.test", 80))).await.err().unwrap();
        assert!(matches!(err, PoolError::TunnelFailed(_)));
        assert_eq!(io::Error::from(err).kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(agent.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_carries_proxy_credentials() {
        let proxy = FakeProxy::start(Behaviour::Echo).await;
        let mut options = proxy.options();
        options.proxy.proxy_auth = Some("user:pass".to_string());
        options
            .proxy
            .headers
            .insert("x-session", hyper::header::HeaderValue::from_static("abc"));
        let agent = TunnelingAgent::http_over_http(options).unwrap();

        let _socket = within(agent.add_request(("a.test", 443))).await.unwrap();

        let head = proxy.heads.lock()[0].to_ascii_lowercase();
        assert!(head.starts_with("connect a.test:443 http/1.1\r\n"));
        assert!(head.contains("host: a.test:443\r\n"));
        assert!(head.contains("proxy-authorization: basic dxnlcjpwyxnz\r\n"));
        assert!(head.contains("x-session: abc\r\n"));
    }

    #[tokio::test]
    async fn test_https_over_http_handshakes_inside_tunnel() {
        let ca = EphemeralCa::generate().unwrap();
        let server = tls_echo_server(&ca, "secure.test").await;
        let proxy = FakeProxy::start(Behaviour::Forward(server)).await;

        let agent = TunnelingAgent::https_over_http(AgentOptions {
            roots: Some(Arc::new(ca.root_store().unwrap())),
            ..proxy.options()
        })
        .unwrap();
        assert_eq!(agent.default_port(), 443);

        let mut socket = within(agent.add_request(Target::new("secure.test")))
            .await
            .unwrap();
        assert!(socket.get_ref().is_tls());
        assert_eq!(socket.target(), ("secure.test", 443));
        echo(&mut socket, b"encrypted hello").await;
        assert_eq!(proxy.request_lines(), vec!["CONNECT secure.test:443 HTTP/1.1"]);
    }

    /// Agent options for a TLS proxy presenting a certificate for
    /// `proxy.test`, trusting only `ca`
    fn tls_proxy_options(proxy: &FakeProxy, ca: &EphemeralCa) -> AgentOptions {
        let mut options = proxy.options();
        options.proxy.servername = Some("proxy.test".to_string());
        options.roots = Some(Arc::new(ca.root_store().unwrap()));
        options
    }

    fn proxy_acceptor(ca: &EphemeralCa) -> TlsAcceptor {
        tls::acceptor_for(&ca.create_certificate("proxy.test").unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_http_over_https_speaks_tls_to_proxy() {
        let ca = EphemeralCa::generate().unwrap();
        let proxy = FakeProxy::start_tls(Behaviour::Echo, proxy_acceptor(&ca)).await;

        let agent = TunnelingAgent::http_over_https(tls_proxy_options(&proxy, &ca)).unwrap();
        assert_eq!(agent.kind(), TunnelKind::HttpOverHttps);
        assert_eq!(agent.default_port(), 80);

        let mut socket = within(agent.add_request(Target::new("plain.test")))
            .await
            .unwrap();
        assert!(!socket.get_ref().is_tls());
        assert_eq!(socket.target(), ("plain.test", 80));
        echo(&mut socket, b"plain payload over a tls proxy").await;
        assert_eq!(proxy.request_lines(), vec!["CONNECT plain.test:80 HTTP/1.1"]);

        drop(socket);
        assert_eq!(agent.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_https_over_https_nests_tls_inside_tls_proxy() {
        let ca = EphemeralCa::generate().unwrap();
        let server = tls_echo_server(&ca, "secure.test").await;
        let proxy = FakeProxy::start_tls(Behaviour::Forward(server), proxy_acceptor(&ca)).await;

        let agent = TunnelingAgent::https_over_https(tls_proxy_options(&proxy, &ca)).unwrap();
        assert_eq!(agent.kind(), TunnelKind::HttpsOverHttps);
        assert_eq!(agent.default_port(), 443);

        let mut socket = within(agent.add_request(Target::new("secure.test")))
            .await
            .unwrap();
        assert!(socket.get_ref().is_tls());
        assert_eq!(socket.target(), ("secure.test", 443));
        echo(&mut socket, b"doubly encrypted hello").await;
        assert_eq!(proxy.request_lines(), vec!["CONNECT secure.test:443 HTTP/1.1"]);
        assert_eq!(agent.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_https_over_https_untrusted_proxy_is_connection_reset() {
        let proxy_ca = EphemeralCa::generate().unwrap();
        let other_ca = EphemeralCa::generate().unwrap();
        let proxy = FakeProxy::start_tls(Behaviour::Echo, proxy_acceptor(&proxy_ca)).await;

        let agent = TunnelingAgent::https_over_https(tls_proxy_options(&proxy, &other_ca)).unwrap();
        let err = within(agent.add_request(Target::new("secure.test")))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, PoolError::TunnelFailed(_)), "got {:?}", err);
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(err.to_string().starts_with("tunneling socket could not be established"));
        assert_eq!(agent.socket_count(), 0);
        assert_eq!(agent.pending_requests(), 0);
        assert!(proxy.request_lines().is_empty());
    }

    #[tokio::test]
    async fn test_servername_override_is_used_for_verification() {
        let ca = EphemeralCa::generate().unwrap();
        let server = tls_echo_server(&ca, "real.test").await;
        let proxy = FakeProxy::start(Behaviour::Forward(server)).await;

        let agent = TunnelingAgent::https_over_http(AgentOptions {
            roots: Some(Arc::new(ca.root_store().unwrap())),
            ..proxy.options()
        })
        .unwrap();

        let mismatched = within(agent.add_request(Target::new("alias.test"))).await;
        assert!(matches!(mismatched, Err(PoolError::Tls(_))));
        assert_eq!(agent.socket_count(), 0);

        let target = Target::new("alias.test").with_tls(TlsOptions {
            servername: Some("real.test".to_string()),
            ..TlsOptions::default()
        });
        let mut socket = within(agent.add_request(target)).await.unwrap();
        echo(&mut socket, b"ok").await;
    }

    #[tokio::test]
    async fn test_pfx_credentials_are_rejected() {
        let proxy = FakeProxy::start(Behaviour::Echo).await;
        let ca = EphemeralCa::generate().unwrap();
        let agent = TunnelingAgent::https_over_http(AgentOptions {
            roots: Some(Arc::new(ca.root_store().unwrap())),
            ..proxy.options()
        })
        .unwrap();

        let target = Target::new("secure.test").with_tls(TlsOptions {
            pfx: Some(vec![0x30, 0x82]),
            ..TlsOptions::default()
        });
        let result = within(agent.add_request(target)).await;
        assert!(matches!(result, Err(PoolError::UnsupportedCredential("pfx"))));
        assert_eq!(agent.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_detach_releases_slot_and_keeps_stream() {
        let proxy = FakeProxy::start(Behaviour::Echo).await;
        let agent = TunnelingAgent::http_over_http(AgentOptions {
            max_sockets: 1,
            ..proxy.options()
        })
        .unwrap();

        let socket = within(agent.add_request(("a.test", 80))).await.unwrap();
        let queued = agent.add_request(("b.test", 80));

        let mut stream = socket.detach();
        let queued = within(queued).await.unwrap();
        assert_eq!(queued.target(), ("b.test", 80));
        echo(&mut stream, b"still open").await;
    }

    #[tokio::test]
    async fn test_abandoned_queued_request_is_skipped() {
        let proxy = FakeProxy::start(Behaviour::Echo).await;
        let agent = TunnelingAgent::http_over_http(AgentOptions {
            max_sockets: 1,
            ..proxy.options()
        })
        .unwrap();

        let first = within(agent.add_request(("a.test", 80))).await.unwrap();
        drop(agent.add_request(("gone.test", 80)));
        let kept = agent.add_request(("b.test", 80));

        drop(first);
        let kept = within(kept).await.unwrap();
        assert_eq!(kept.target(), ("b.test", 80));
        wait_for(|| proxy.connects() == 2).await;
        assert!(!proxy
            .request_lines()
            .iter()
            .any(|line| line.contains("gone.test")));
    }

    #[test]
    fn test_target_forms() {
        let target = Target::from(("example.com", 8443, "/index.html"));
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, Some(8443));
        assert_eq!(target.path.as_deref(), Some("/index.html"));

        let target = Target::from(("example.com", 80));
        assert_eq!(target.path, None);
        assert_eq!(Target::new("example.com").port, None);
    }

    #[test]
    fn test_tunnel_kind_defaults() {
        assert_eq!(TunnelKind::HttpOverHttp.default_port(), 80);
        assert_eq!(TunnelKind::HttpOverHttps.default_port(), 80);
        assert_eq!(TunnelKind::HttpsOverHttp.default_port(), 443);
        assert_eq!(TunnelKind::HttpsOverHttps.default_port(), 443);
        assert!(TunnelKind::HttpsOverHttps.proxy_tls());
        assert!(!TunnelKind::HttpsOverHttp.proxy_tls());
    }

    #[test]
    fn test_invalid_options() {
        let options = AgentOptions {
            proxy: ProxyOptions {
                host: "proxy.local".to_string(),
                port: 3128,
                ..ProxyOptions::default()
            },
            max_sockets: 0,
            roots: None,
        };
        assert!(matches!(
            TunnelingAgent::http_over_http(options),
            Err(PoolError::InvalidConfig(_))
        ));
        assert!(matches!(
            TunnelingAgent::http_over_http(AgentOptions::default()),
            Err(PoolError::InvalidConfig(_))
        ));
    }
}
