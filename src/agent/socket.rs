use std::io;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use super::AgentInner;

/// Byte stream carried by an established tunnel
pub enum TunnelStream {
    Plain(TokioIo<Upgraded>),
    Tls(Box<tokio_rustls::client::TlsStream<TokioIo<Upgraded>>>),
}

impl TunnelStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, TunnelStream::Tls(_))
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TunnelStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TunnelStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TunnelStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(s) => Pin::new(s).poll_flush(cx),
            TunnelStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TunnelStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Holds one agent slot; dropping it releases the slot
pub(crate) struct Lease {
    pub(crate) slot: u64,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) agent: Weak<AgentInner>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(agent) = self.agent.upgrade() {
            agent.remove_socket(self.slot);
        }
    }
}

/// Tunnel socket on loan from a `TunnelingAgent`
///
/// Dropping the socket closes the tunnel and frees its slot. Call
/// [`PooledSocket::free`] instead to offer it to a queued request for the
/// same destination, or [`PooledSocket::detach`] to take the stream out of
/// the pool.
pub struct PooledSocket {
    stream: TunnelStream,
    lease: Lease,
}

impl PooledSocket {
    pub(crate) fn new(stream: TunnelStream, lease: Lease) -> Self {
        Self { stream, lease }
    }

    /// Destination the tunnel was opened to
    pub fn target(&self) -> (&str, u16) {
        (&self.lease.host, self.lease.port)
    }

    pub fn get_ref(&self) -> &TunnelStream {
        &self.stream
    }

    /// Signal that the socket is idle
    ///
    /// The oldest queued request for the same host and port takes the socket
    /// over. With no such request the tunnel is closed and the slot released.
    pub fn free(self) {
        let PooledSocket { stream, lease } = self;
        let Some(agent) = lease.agent.upgrade() else {
            return;
        };

        match agent.take_matching(&lease.host, lease.port) {
            Some(request) => {
                debug!(host = %lease.host, port = lease.port, "Reusing tunnel for queued request");
                let _ = request.reply.send(Ok(PooledSocket { stream, lease }));
            }
            None => {
                debug!(host = %lease.host, port = lease.port, "No queued request for tunnel, closing");
                drop(stream);
                drop(lease);
            }
        }
    }

    /// Remove the socket from the agent and keep the stream
    pub fn detach(self) -> TunnelStream {
        let PooledSocket { stream, lease } = self;
        drop(lease);
        stream
    }
}

impl AsyncRead for PooledSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
