//! Adapter turning a [`ServerHandler`] into a listener.
//!
//! The pool pushes inbound tunnel channels into a `ServerHandler`; generic
//! servers want the opposite shape, a listener they can `accept` from. The
//! adapter bridges the two: `handle_connection` posts the connection onto an
//! internal channel and blocks until that connection is closed, while
//! [`HandlerListener::accept`] yields it to the serving side.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::session::{ServerHandler, TunnelConn};

/// Network name reported by [`ReverseTunnelAddr`].
pub const REVERSE_TUNNEL_NETWORK: &str = "ssh-reversetunnel";

/// Synthetic address for a listener backed by reverse-tunnel channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseTunnelAddr(String);

impl ReverseTunnelAddr {
    pub fn network(&self) -> &'static str {
        REVERSE_TUNNEL_NETWORK
    }
}

impl fmt::Display for ReverseTunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Creates the adapter. The returned value is used both as the pool's
/// [`ServerHandler`] and as the listener handed to a serving loop.
pub fn handler_listener(tunnel_addr: impl Into<String>) -> Arc<HandlerListener> {
    let (tx, rx) = mpsc::channel(1);
    Arc::new(HandlerListener {
        tx,
        rx: Mutex::new(rx),
        closed: CancellationToken::new(),
        addr: ReverseTunnelAddr(tunnel_addr.into()),
    })
}

pub struct HandlerListener {
    tx: mpsc::Sender<TrackedConn>,
    rx: Mutex<mpsc::Receiver<TrackedConn>>,
    closed: CancellationToken,
    addr: ReverseTunnelAddr,
}

impl HandlerListener {
    /// Next tunneled connection. Fails with `UnexpectedEof` once closed.
    pub async fn accept(&self) -> io::Result<TunnelConn> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            conn = rx.recv() => match conn {
                Some(conn) => Ok(Box::new(conn) as TunnelConn),
                None => Err(closed_error()),
            },
        }
    }

    /// Stops accepting. Safe to call any number of times.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn addr(&self) -> &ReverseTunnelAddr {
        &self.addr
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "reverse tunnel listener closed")
}

#[async_trait]
impl ServerHandler for HandlerListener {
    async fn handle_connection(&self, conn: TunnelConn) {
        let (conn, done) = TrackedConn::new(conn);
        tokio::select! {
            _ = self.closed.cancelled() => return,
            sent = self.tx.send(conn) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        // The connection is in use by whoever accepted it; stay blocked until
        // it is shut down or dropped.
        let _ = done.await;
    }
}

/// Wraps a tunnel connection with a one-shot closed signal.
struct TrackedConn {
    inner: TunnelConn,
    done: Option<oneshot::Sender<()>>,
}

impl TrackedConn {
    fn new(inner: TunnelConn) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner,
                done: Some(tx),
            },
            rx,
        )
    }

    fn mark_closed(&mut self) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TrackedConn {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

impl AsyncRead for TrackedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let res = std::task::ready!(Pin::new(&mut self.inner).poll_shutdown(cx));
        self.mark_closed();
        Poll::Ready(res)
    }
}
