//! Per-hostname pool of locally terminated HTTPS listeners
//!
//! The first `create_server` call for a hostname issues a certificate, binds a
//! listener on a pooled port and starts accepting TLS connections. Concurrent
//! and later callers share the same entry until it is removed by a lifecycle
//! guard (listener error, failed handshake, liveness timeout), by capacity
//! eviction, or by `destroy`.

mod future;
mod idle;
mod listener;
mod port;

pub use idle::IdleStream;
pub use listener::{ConnectionHandler, SecureListener, SecureStream};
pub use port::{PortAllocator, PortRange};

use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::cert::CertificateIssuer;
use crate::error::{PoolError, Result};
use crate::tls;
use future::PortFuture;
use listener::{FaultHook, ListenerOptions};

/// Server pool configuration
#[derive(Debug, Clone)]
pub struct ServerPoolConfig {
    /// Live entry count above which idle servers are evicted
    pub max_servers: usize,
    /// Window for the first successful handshake; also the grace period
    /// before a removed server's listener is closed
    pub liveness_timeout: Duration,
    /// Grace period before listeners are closed by `destroy`
    pub close_delay: Duration,
    /// Ports handed out to listeners
    pub ports: PortRange,
    /// Port tried once before the range
    pub default_port: Option<u16>,
    /// Optional cap on consecutive failed binds
    pub max_bind_attempts: Option<u32>,
}

impl Default for ServerPoolConfig {
    fn default() -> Self {
        Self {
            max_servers: 220,
            liveness_timeout: Duration::from_millis(6000),
            close_delay: Duration::from_millis(100),
            ports: PortRange::default(),
            default_port: None,
            max_bind_attempts: None,
        }
    }
}

#[derive(Default)]
struct ListenerSlot {
    listener: Option<Arc<SecureListener>>,
    close_after: Option<Duration>,
}

struct ServerEntry {
    id: u64,
    hostname: String,
    port: PortFuture,
    listener: Mutex<ListenerSlot>,
    sweeping: AtomicBool,
}

impl ServerEntry {
    fn new(id: u64, hostname: &str) -> Self {
        Self {
            id,
            hostname: hostname.to_string(),
            port: PortFuture::new(),
            listener: Mutex::new(ListenerSlot::default()),
            sweeping: AtomicBool::new(false),
        }
    }

    fn connections(&self) -> Option<usize> {
        self.listener
            .lock()
            .listener
            .as_ref()
            .map(|listener| listener.connections())
    }

    fn attach(&self, listener: Arc<SecureListener>) {
        let close_after = {
            let mut slot = self.listener.lock();
            slot.listener = Some(listener.clone());
            slot.close_after
        };
        if let Some(delay) = close_after {
            close_later(self.hostname.clone(), listener, delay);
        }
    }

    /// Close the listener after `delay`, or as soon as it attaches
    fn retire(&self, delay: Duration) {
        let listener = {
            let mut slot = self.listener.lock();
            if slot.listener.is_none() {
                slot.close_after = Some(delay);
            }
            slot.listener.clone()
        };
        if let Some(listener) = listener {
            close_later(self.hostname.clone(), listener, delay);
        }
    }
}

fn close_later(hostname: String, listener: Arc<SecureListener>, delay: Duration) {
    if delay.is_zero() {
        if let Err(e) = listener.close() {
            debug!(%hostname, "Ignoring close error: {}", e);
        }
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = listener.close() {
            debug!(%hostname, "Ignoring close error: {}", e);
        }
    });
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, Arc<ServerEntry>>,
    next_id: u64,
}

struct PoolInner {
    config: ServerPoolConfig,
    issuer: Arc<dyn CertificateIssuer>,
    allocator: PortAllocator,
    state: Mutex<PoolState>,
}

/// Hostname → local HTTPS listener pool
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct ServerPool {
    inner: Arc<PoolInner>,
}

impl ServerPool {
    pub fn new(config: ServerPoolConfig, issuer: Arc<dyn CertificateIssuer>) -> Self {
        let allocator = PortAllocator::new(config.ports)
            .with_default_port(config.default_port)
            .with_max_attempts(config.max_bind_attempts);

        Self {
            inner: Arc::new(PoolInner {
                config,
                issuer,
                allocator,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Whether an entry (pending or ready) exists for `hostname`
    pub fn exists(&self, hostname: &str) -> bool {
        self.inner.state.lock().entries.contains_key(hostname)
    }

    /// Number of live entries
    pub fn server_count(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Open connections on the hostname's listener, if it is running
    pub fn connection_count(&self, hostname: &str) -> Option<usize> {
        let entry = self.inner.state.lock().entries.get(hostname).cloned();
        entry.and_then(|entry| entry.connections())
    }

    /// Get or create the listener for `hostname` and resolve to its port
    ///
    /// Registration happens before this returns, so calls made before the
    /// first resolves all share one creation.
    pub fn create_server(
        &self,
        hostname: &str,
        handler: Arc<dyn ConnectionHandler>,
        idle_timeout: Option<Duration>,
    ) -> impl Future<Output = Result<u16>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.create_server_with(hostname, handler, idle_timeout, move |result| {
            let _ = tx.send(result);
        });

        let hostname = hostname.to_string();
        async move {
            rx.await.map_err(|_| PoolError::ServerUnavailable {
                hostname,
                reason: "creation was abandoned".to_string(),
            })?
        }
    }

    /// Callback flavour of `create_server`
    ///
    /// `callback` runs once with the port: immediately when the entry is
    /// ready, otherwise after every earlier waiter on the same hostname.
    /// `handler` and `idle_timeout` only matter for the call that creates
    /// the entry; a zero `idle_timeout` is ignored.
    pub fn create_server_with<F>(
        &self,
        hostname: &str,
        handler: Arc<dyn ConnectionHandler>,
        idle_timeout: Option<Duration>,
        callback: F,
    ) where
        F: FnOnce(Result<u16>) + Send + 'static,
    {
        let (entry, created) = {
            let mut state = self.inner.state.lock();
            match state.entries.get(hostname) {
                Some(entry) => (entry.clone(), false),
                None => {
                    state.next_id += 1;
                    let entry = Arc::new(ServerEntry::new(state.next_id, hostname));
                    state.entries.insert(hostname.to_string(), entry.clone());
                    (entry, true)
                }
            }
        };

        let host = hostname.to_string();
        entry.port.on_ready(move |outcome| {
            callback(outcome.map_err(|reason| PoolError::ServerUnavailable {
                hostname: host,
                reason,
            }))
        });

        if !created {
            return;
        }

        self.inner.free_server(entry.id);
        let idle_timeout = idle_timeout.filter(|t| !t.is_zero());
        tokio::spawn(self.inner.clone().provision(entry, handler, idle_timeout));
    }

    /// Forget `hostname` now and close its listener after the liveness window
    pub fn remove_server(&self, hostname: &str) {
        let entry = self.inner.state.lock().entries.remove(hostname);
        if let Some(entry) = entry {
            debug!(%hostname, "Server removed");
            entry.retire(self.inner.config.liveness_timeout);
        }
    }

    /// Drop every entry and close all listeners after the close delay
    pub fn destroy(&self) {
        let entries = std::mem::take(&mut self.inner.state.lock().entries);
        info!(count = entries.len(), "Destroying server pool");
        for entry in entries.into_values() {
            entry.retire(self.inner.config.close_delay);
        }
    }
}

impl PoolInner {
    #[instrument(skip(self, entry, handler), fields(hostname = %entry.hostname))]
    async fn provision(
        self: Arc<Self>,
        entry: Arc<ServerEntry>,
        handler: Arc<dyn ConnectionHandler>,
        idle_timeout: Option<Duration>,
    ) {
        match self.start_listener(&entry, handler, idle_timeout).await {
            Ok(port) => {
                info!(port, "Server ready");
                entry.port.resolve(Ok(port));
            }
            Err(e) => {
                warn!("Server creation failed: {}", e);
                self.remove_entry(&entry.hostname, entry.id, "creation failed");
                entry.port.resolve(Err(e.to_string()));
            }
        }
    }

    async fn start_listener(
        self: &Arc<Self>,
        entry: &ServerEntry,
        handler: Arc<dyn ConnectionHandler>,
        idle_timeout: Option<Duration>,
    ) -> Result<u16> {
        let cert = self.issuer.create_certificate(&entry.hostname)?;
        let acceptor = tls::acceptor_for(&cert)?;
        let (listener, port) = self
            .allocator
            .allocate(|port| TcpListener::bind((Ipv4Addr::LOCALHOST, port)))
            .await?;

        let pool = Arc::downgrade(self);
        let hostname = entry.hostname.clone();
        let id = entry.id;
        let on_fault: FaultHook = Arc::new(move |reason| {
            if let Some(pool) = pool.upgrade() {
                pool.remove_entry(&hostname, id, reason);
            }
        });

        let listener = SecureListener::start(
            listener,
            port,
            acceptor,
            handler,
            ListenerOptions {
                liveness_timeout: self.config.liveness_timeout,
                idle_timeout,
            },
            on_fault,
        );
        entry.attach(listener);
        Ok(port)
    }

    /// Remove `hostname` only if it still maps to entry `id`
    fn remove_entry(&self, hostname: &str, id: u64, reason: &str) {
        let entry = {
            let mut state = self.state.lock();
            match state.entries.get(hostname) {
                Some(entry) if entry.id == id => state.entries.remove(hostname),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            debug!(%hostname, reason, "Server removed");
            entry.retire(self.config.liveness_timeout);
        }
    }

    /// Evict idle servers while the pool is over capacity
    ///
    /// `creating` is the entry whose creation triggered the sweep; it is
    /// never a candidate.
    fn free_server(self: &Arc<Self>, creating: u64) {
        let candidates: Vec<Arc<ServerEntry>> = {
            let state = self.state.lock();
            if state.entries.len() <= self.config.max_servers {
                return;
            }
            state
                .entries
                .values()
                .filter(|entry| entry.id != creating)
                .cloned()
                .collect()
        };
        debug!(
            candidates = candidates.len(),
            "Server pool over capacity, sweeping idle servers"
        );

        for entry in candidates {
            if entry.sweeping.swap(true, Ordering::SeqCst) {
                continue;
            }
            let pool: Weak<PoolInner> = Arc::downgrade(self);
            let target = entry.clone();
            entry.port.on_ready(move |outcome| {
                target.sweeping.store(false, Ordering::SeqCst);
                if outcome.is_ok() {
                    if let Some(pool) = pool.upgrade() {
                        pool.evict_if_idle(&target);
                    }
                }
            });
        }
    }

    fn evict_if_idle(&self, entry: &ServerEntry) {
        if entry.connections() != Some(0) {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.entries.len() <= self.config.max_servers {
                return;
            }
            match state.entries.get(&entry.hostname) {
                Some(current) if current.id == entry.id => {}
                _ => return,
            }
            state.entries.remove(&entry.hostname);
        }
        info!(hostname = %entry.hostname, "Evicted idle server");
        entry.retire(Duration::ZERO);
    }
}
