//! Locally terminated TLS listener backing one server pool entry

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use super::idle::IdleStream;
use crate::error::{PoolError, Result};

/// Decrypted client connection handed to a `ConnectionHandler`
pub type SecureStream = tokio_rustls::server::TlsStream<IdleStream<TcpStream>>;

/// Processes decrypted traffic once the TLS handshake completed
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: SecureStream, peer: SocketAddr);
}

/// Called with a short reason when the listener should be retired
pub(crate) type FaultHook = Arc<dyn Fn(&'static str) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ListenerOptions {
    /// Window for the first successful handshake
    pub liveness_timeout: Duration,
    /// Per-socket inactivity limit
    pub idle_timeout: Option<Duration>,
}

/// Tracks one live connection for as long as it is held
struct ConnectionGuard {
    connections: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(connections: Arc<AtomicUsize>) -> Self {
        connections.fetch_add(1, Ordering::SeqCst);
        Self { connections }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SecureListener {
    port: u16,
    connections: Arc<AtomicUsize>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    liveness: Mutex<Option<JoinHandle<()>>>,
}

impl SecureListener {
    /// Start accepting on `listener`
    ///
    /// `on_fault` fires on an accept error, on a failed handshake, and when no
    /// handshake succeeds within the liveness window.
    pub(crate) fn start(
        listener: TcpListener,
        port: u16,
        acceptor: TlsAcceptor,
        handler: Arc<dyn ConnectionHandler>,
        options: ListenerOptions,
        on_fault: FaultHook,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            port,
            connections: Arc::new(AtomicUsize::new(0)),
            accept_task: Mutex::new(None),
            liveness: Mutex::new(None),
        });

        let timer_fault = on_fault.clone();
        let liveness = tokio::spawn(async move {
            tokio::time::sleep(options.liveness_timeout).await;
            debug!(port, "No secure connection within liveness window");
            timer_fault("liveness timeout");
        });
        *this.liveness.lock() = Some(liveness);

        let accept = tokio::spawn(accept_loop(
            Arc::downgrade(&this),
            listener,
            acceptor,
            handler,
            options.idle_timeout,
            on_fault,
        ));
        *this.accept_task.lock() = Some(accept);

        this
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of accepted sockets still open
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn mark_secure(&self) {
        if let Some(timer) = self.liveness.lock().take() {
            timer.abort();
        }
    }

    /// Stop accepting new connections; open connections keep running
    pub fn close(&self) -> Result<()> {
        let task = self.accept_task.lock().take();
        let Some(task) = task else {
            return Err(PoolError::ListenerClosed);
        };
        task.abort();
        self.mark_secure();
        debug!(port = self.port, "Listener closed");
        Ok(())
    }
}

impl Drop for SecureListener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

async fn accept_loop(
    owner: Weak<SecureListener>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: Arc<dyn ConnectionHandler>,
    idle_timeout: Option<Duration>,
    on_fault: FaultHook,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Listener error: {}", e);
                on_fault("listener error");
                return;
            }
        };
        let Some(owner) = owner.upgrade() else {
            return;
        };

        let guard = ConnectionGuard::new(owner.connections.clone());
        let acceptor = acceptor.clone();
        let handler = handler.clone();
        let on_fault = on_fault.clone();

        tokio::spawn(async move {
            let _guard = guard;
            match acceptor.accept(IdleStream::new(stream, idle_timeout)).await {
                Ok(stream) => {
                    owner.mark_secure();
                    handler.handle(stream, peer).await;
                }
                Err(e) => {
                    debug!(%peer, port = owner.port, "TLS handshake failed: {}", e);
                    on_fault("tls client error");
                }
            }
        });
    }
}
