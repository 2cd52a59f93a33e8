//! Socket-level progress deadlines for inbound connections.
//!
//! Wraps a stream so that a read poll with no progress for `read_limit`
//! (or a write poll for `write_limit`) fails with `TimedOut`, tearing the
//! connection down. Reads cover both slow request bodies and idle
//! keep-alive connections waiting for the next request; a zero limit
//! disables that side's deadline.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Sleep, sleep};

pub struct TimeoutStream<T> {
    inner: T,
    read_limit: Duration,
    write_limit: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<T> TimeoutStream<T> {
    pub fn new(inner: T, read_limit: Duration, write_limit: Duration) -> Self {
        TimeoutStream {
            inner,
            read_limit,
            write_limit,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

/// Arms the deadline on first pending poll and reports whether it expired.
/// The deadline stays armed across pending polls and is cleared by the
/// caller on progress.
fn expired(slot: &mut Option<Pin<Box<Sleep>>>, limit: Duration, cx: &mut Context<'_>) -> bool {
    if limit.is_zero() {
        return false;
    }
    let deadline = slot.get_or_insert_with(|| Box::pin(sleep(limit)));
    match deadline.as_mut().poll(cx) {
        Poll::Ready(()) => {
            *slot = None;
            true
        }
        Poll::Pending => false,
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for TimeoutStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if expired(&mut this.read_deadline, this.read_limit, cx) {
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connection read timed out",
                    )))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TimeoutStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if expired(&mut this.write_deadline, this.write_limit, cx) {
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connection write timed out",
                    )))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if expired(&mut this.write_deadline, this.write_limit, cx) {
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connection write timed out",
                    )))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
