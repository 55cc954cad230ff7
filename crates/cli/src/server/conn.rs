//! Accept loop in front of the router
//!
//! Each connection carries one request. A `GET` of the check-in path is
//! answered by [`checkin::respond`]; everything else is replayed into hyper
//! and served by the axum router.

use super::checkin::{self, RequestHead};
use super::AppState;
use axum::Router;
use bytes::{Bytes, BytesMut};
use hyper::server::conn::Http;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Time a client gets to send its request head
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Time open connections get to finish after shutdown is requested
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Serve connections from `listener` until `shutdown` resolves
pub async fn run<F>(
    listener: TcpListener,
    app: Router,
    state: AppState,
    checkin_path: &str,
    shutdown: F,
) -> io::Result<()>
where
    F: Future<Output = ()>,
{
    let checkin_path: Arc<str> = Arc::from(checkin_path);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let app = app.clone();
                    let state = state.clone();
                    let checkin_path = checkin_path.clone();
                    connections.spawn(async move {
                        connection(stream, peer, app, state, &checkin_path).await
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    info!("Shutting down, draining {} connections", connections.len());
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Dropping {} connections still open", connections.len());
        connections.abort_all();
    }
    Ok(())
}

async fn connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    state: AppState,
    checkin_path: &str,
) {
    let mut buf = BytesMut::with_capacity(1024);
    let read = checkin::read_head(&mut stream, &mut buf);
    let end = match tokio::time::timeout(HEAD_TIMEOUT, read).await {
        Ok(Ok(end)) => end,
        Ok(Err(e)) => {
            debug!("Reading request from {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("No request head from {} in time", peer);
            return;
        }
    };

    if let Some(head) = end.and_then(|end| RequestHead::parse(&buf[..end])) {
        if head.method == "GET" && head.path == checkin_path {
            checkin::respond(stream, peer, &state, head).await;
            return;
        }
    }
    if buf.is_empty() {
        return;
    }

    let io = Replay::new(buf.freeze(), stream);
    if let Err(e) = Http::new()
        .http1_keep_alive(false)
        .serve_connection(io, app)
        .await
    {
        debug!("Connection from {} ended: {}", peer, e);
    }
}

/// A stream that first yields bytes already read from it
pub struct Replay<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Replay<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Replay<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Replay<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
