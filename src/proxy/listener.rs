//! Local TCP listener and the accepted client link.
//!
//! Binds the loopback interface only. At most one client is served at a time;
//! while one is attached, additional connections are rejected immediately
//! with an RST (SO_LINGER 0) so clients fail fast instead of hanging in the
//! accept backlog.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::ProxyError;

/// The loopback listener owned by the engine.
#[derive(Debug)]
pub struct ProxyListener {
    inner: TcpListener,
    local: SocketAddr,
}

impl ProxyListener {
    /// Bind `127.0.0.1:<port>`; `0` asks the OS for an ephemeral port.
    pub async fn bind(port: u16) -> Result<Self, ProxyError> {
        let inner = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(ProxyError::Bind)?;
        let local = inner.local_addr().map_err(ProxyError::Bind)?;
        Ok(Self { inner, local })
    }

    pub fn local_port(&self) -> u16 {
        self.local.port()
    }

    /// Accept the next client.
    pub async fn accept(&self) -> Result<ClientLink, ProxyError> {
        let (stream, peer) = self.inner.accept().await.map_err(ProxyError::Client)?;
        // Interactive protocols (ssh, vnc) want small writes on the wire now.
        let _ = stream.set_nodelay(true);
        Ok(ClientLink::new(stream, peer))
    }
}

/// One accepted local TCP connection.
pub struct ClientLink {
    stream: TcpStream,
    pub peer: SocketAddr,
    /// Bytes read from the client and forwarded into the tunnel.
    pub bytes_up: Arc<AtomicU64>,
    /// Bytes received from the tunnel and written to the client.
    pub bytes_down: Arc<AtomicU64>,
}

impl ClientLink {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            bytes_up: Arc::new(AtomicU64::new(0)),
            bytes_down: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Split into pump halves. Counters stay shared with the link owner.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }

    /// Close immediately with an RST instead of a graceful FIN. Used for
    /// surplus clients and for the attached client when the tunnel dies.
    pub fn reject(self) {
        reset(self.stream, self.peer);
    }

    pub fn transferred(&self) -> (u64, u64) {
        (
            self.bytes_up.load(Ordering::Relaxed),
            self.bytes_down.load(Ordering::Relaxed),
        )
    }
}

/// Drop a TCP stream with SO_LINGER 0 so the peer sees a reset.
pub fn reset(stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_linger(Some(Duration::ZERO));
    drop(stream);
    debug!("reset connection from {peer}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn bind_reports_the_chosen_port() {
        let listener = ProxyListener::bind(0).await.expect("bind");
        assert_ne!(listener.local_port(), 0);
    }

    #[tokio::test]
    async fn bind_conflict_is_a_bind_error() {
        let first = ProxyListener::bind(0).await.expect("bind");
        let err = ProxyListener::bind(first.local_port())
            .await
            .expect_err("port is taken");
        assert_eq!(err.exit_code(), 6);
    }

    #[tokio::test]
    async fn rejected_clients_are_disconnected_promptly() {
        let listener = ProxyListener::bind(0).await.expect("bind");
        let port = listener.local_port();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let link = listener.accept().await.expect("accept");
        link.reject();

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .expect("disconnect observed in time");
        // RST surfaces as an error on most platforms, EOF on some.
        match read {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("unexpected {n} bytes from rejected connection"),
        }
    }
}
