use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

pin_project! {
    /// Stream that fails with `TimedOut` after `timeout` without reads or writes
    pub struct IdleStream<S> {
        #[pin]
        inner: S,
        deadline: Option<Pin<Box<Sleep>>>,
        timeout: Option<Duration>,
    }
}

impl<S> IdleStream<S> {
    /// `None` disables the idle check
    pub fn new(inner: S, timeout: Option<Duration>) -> Self {
        Self {
            inner,
            deadline: timeout.map(|t| Box::pin(sleep(t))),
            timeout,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

fn touch(deadline: &mut Option<Pin<Box<Sleep>>>, timeout: Option<Duration>) {
    if let (Some(sleep), Some(timeout)) = (deadline.as_mut(), timeout) {
        sleep.as_mut().reset(Instant::now() + timeout);
    }
}

fn poll_expired<T>(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    cx: &mut Context<'_>,
) -> Poll<io::Result<T>> {
    if let Some(sleep) = deadline.as_mut() {
        if sleep.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "socket idle timeout",
            )));
        }
    }
    Poll::Pending
}

impl<S: AsyncRead> AsyncRead for IdleStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(result) => {
                touch(this.deadline, *this.timeout);
                Poll::Ready(result)
            }
            Poll::Pending => poll_expired(this.deadline, cx),
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for IdleStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(result) => {
                touch(this.deadline, *this.timeout);
                Poll::Ready(result)
            }
            Poll::Pending => poll_expired(this.deadline, cx),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
