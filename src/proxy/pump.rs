//! The duplex pump: two independent transfer loops per attachment.
//!
//! Each loop reads from its source and writes to the other side, so reads
//! are naturally gated by writes: no queue exists between the directions
//! and memory stays bounded by one frame buffer per direction. Pumps never
//! recover locally: they report how they ended and return, and the engine
//! decides what happens to the session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::trace;

use crate::error::ProxyError;
use crate::shutdown::StopHandle;
use crate::tunnel::{TunnelEvent, TunnelReceiver, TunnelSender};

/// How a pump ended. The engine maps this onto the session policy.
#[derive(Debug)]
pub enum PumpEnd {
    /// The local client closed its write side.
    LocalEof,
    /// No client data within the configured idle timeout.
    IdleTimeout,
    /// The local socket failed.
    LocalError(std::io::Error),
    /// The tunnel peer closed.
    TunnelClosed {
        code: Option<u16>,
        reason: String,
    },
    /// The tunnel failed.
    TunnelError(ProxyError),
    /// The stop event fired.
    Cancelled,
}

/// Client → tunnel. Reads at most one frame's worth of bytes at a time and
/// forwards them in order. Returns the read half so the engine can reunite
/// the stream for a hard reset when needed.
pub async fn tcp_to_tunnel(
    mut read: OwnedReadHalf,
    sender: TunnelSender,
    max_frame: usize,
    idle_timeout: Option<Duration>,
    bytes_up: Arc<AtomicU64>,
    mut stop: StopHandle,
) -> (PumpEnd, OwnedReadHalf) {
    let mut buf = vec![0u8; max_frame];
    loop {
        let result = tokio::select! {
            _ = stop.stopped() => None,
            result = read_client(&mut read, &mut buf, idle_timeout) => Some(result),
        };
        let n = match result {
            None => return (PumpEnd::Cancelled, read),
            Some(Ok(0)) => return (PumpEnd::LocalEof, read),
            Some(Ok(n)) => n,
            Some(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                return (PumpEnd::IdleTimeout, read);
            }
            Some(Err(e)) => return (PumpEnd::LocalError(e), read),
        };
        if let Err(e) = sender.send(&buf[..n]).await {
            return (PumpEnd::TunnelError(e), read);
        }
        bytes_up.fetch_add(n as u64, Ordering::Relaxed);
        trace!("forwarded {n} bytes to tunnel");
    }
}

async fn read_client(
    read: &mut OwnedReadHalf,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> std::io::Result<usize> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, read.read(buf))
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "client idle timeout",
                ))
            }),
        None => read.read(buf).await,
    }
}

/// Tunnel → client. Writes each frame payload in arrival order. Returns the
/// write half and the receiver so the engine can reunite the stream and
/// finish the tunnel's closing handshake.
pub async fn tunnel_to_tcp(
    mut receiver: TunnelReceiver,
    mut write: OwnedWriteHalf,
    bytes_down: Arc<AtomicU64>,
    mut stop: StopHandle,
) -> (PumpEnd, OwnedWriteHalf, TunnelReceiver) {
    loop {
        let event = tokio::select! {
            _ = stop.stopped() => None,
            event = receiver.recv() => Some(event),
        };
        let Some(event) = event else {
            return (PumpEnd::Cancelled, write, receiver);
        };
        match event {
            Ok(TunnelEvent::Data(payload)) => {
                if let Err(e) = write.write_all(&payload).await {
                    return (PumpEnd::LocalError(e), write, receiver);
                }
                bytes_down.fetch_add(payload.len() as u64, Ordering::Relaxed);
                trace!("forwarded {} bytes to client", payload.len());
            }
            Ok(TunnelEvent::Closed { code, reason }) => {
                return (PumpEnd::TunnelClosed { code, reason }, write, receiver);
            }
            Err(e) => return (PumpEnd::TunnelError(e), write, receiver),
        }
    }
}
