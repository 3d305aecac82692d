//! Listening socket

use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use socket2::SockRef;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::error::{Result, ServerError};

/// Pending connections the kernel may queue for us
const LISTEN_BACKLOG: u32 = 1024;

/// Passive socket bound to the configured address
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    send_buffer_size: Option<usize>,
}

impl Listener {
    /// Bind and listen. Failure here is fatal for `start`.
    pub fn bind(addr: SocketAddr, send_buffer_size: Option<usize>) -> Result<Self> {
        let bind_err = |source| ServerError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let inner = socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
        let local_addr = inner.local_addr().map_err(bind_err)?;

        tracing::info!("Listening on {}", local_addr);
        Ok(Self {
            inner,
            local_addr,
            send_buffer_size,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept every connection that is ready right now.
    ///
    /// Returns `Pending` (with the waker registered) only when nothing was
    /// accepted.
    pub fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<Vec<(TcpStream, SocketAddr)>> {
        let mut accepted = Vec::new();
        loop {
            match self.inner.poll_accept(cx) {
                Poll::Ready(Ok((stream, peer))) => {
                    if let Err(e) = self.configure(&stream) {
                        tracing::warn!("Failed to configure socket for {}: {}", peer, e);
                    }
                    accepted.push((stream, peer));
                }
                Poll::Ready(Err(e)) => {
                    // Typically EMFILE or a connection reset before accept
                    tracing::warn!("Failed to accept connection: {}", e);
                    break;
                }
                Poll::Pending => break,
            }
        }

        if accepted.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(accepted)
        }
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        if let Some(size) = self.send_buffer_size {
            SockRef::from(stream).set_send_buffer_size(size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn test_accepts_batch() {
        let listener = Listener::bind(loopback(), Some(16 * 1024)).unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();

        let mut total = 0;
        while total < 2 {
            let batch = poll_fn(|cx| listener.poll_accept(cx)).await;
            assert!(!batch.is_empty());
            total += batch.len();
        }
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = Listener::bind(loopback(), None).unwrap();
        let taken = first.local_addr();

        match Listener::bind(taken, None) {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, taken),
            other => panic!("expected bind failure, got {:?}", other),
        }
    }
}
