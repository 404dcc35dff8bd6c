//! WebSocket tunnel to the device.
//!
//! One [`Tunnel`] is one live WebSocket carrying opaque binary frames. After
//! the handshake the tunnel splits into a cloneable [`TunnelSender`] (the
//! sink behind a mutex, shared by the data pump and the keepalive task so
//! frames are never interleaved on the wire) and a single-reader
//! [`TunnelReceiver`] that filters control frames inline and feeds a shared
//! liveness clock.
//!
//! Payloads larger than the configured max frame size are split into ordered
//! frames on send; fragmented frames are reassembled by the protocol layer
//! before [`TunnelReceiver::recv`] yields them. The tunnel is binary-only;
//! text frames are protocol errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::error::ProxyError;
use crate::shutdown::StopHandle;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// One event from the receive side of the tunnel.
#[derive(Debug)]
pub enum TunnelEvent {
    /// Payload of one binary frame, delivered in order.
    Data(Vec<u8>),
    /// The peer closed the tunnel. Terminal: delivered exactly once.
    Closed {
        code: Option<u16>,
        reason: String,
    },
}

/// A freshly opened, not yet split tunnel.
pub struct Tunnel {
    stream: WsStream,
    max_frame: usize,
}

impl Tunnel {
    /// Perform the WebSocket upgrade, carrying the bearer in the
    /// `Authorization` header. Certificate validation is skipped only when
    /// `verify_tls` is false.
    pub async fn open(
        url: &str,
        token: &str,
        verify_tls: bool,
        connect_timeout: Duration,
        max_frame: usize,
    ) -> Result<Self, ProxyError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ProxyError::Config(format!("invalid tunnel URL {url}: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ProxyError::Config(format!("token is not header-safe: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let connector = if verify_tls {
            None
        } else {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| ProxyError::Transport(format!("could not build TLS connector: {e}")))?;
            Some(Connector::NativeTls(tls))
        };

        let (stream, response) = tokio::time::timeout(
            connect_timeout,
            tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector),
        )
        .await
        .map_err(|_| ProxyError::Transport("tunnel handshake timed out".into()))?
        .map_err(map_ws_error)?;

        debug!("tunnel established (HTTP {})", response.status());
        Ok(Self { stream, max_frame })
    }

    /// Split into the shared send side and the single-reader receive side.
    pub fn split(self) -> (TunnelSender, TunnelReceiver) {
        let (sink, stream) = self.stream.split();
        let liveness = Arc::new(Mutex::new(Instant::now()));
        let sender = TunnelSender {
            sink: Arc::new(Mutex::new(sink)),
            closing: Arc::new(AtomicBool::new(false)),
            max_frame: self.max_frame,
        };
        let receiver = TunnelReceiver {
            stream,
            liveness,
            closed: false,
        };
        (sender, receiver)
    }
}

/// Send side of a tunnel. Cloneable; all clones serialize their frame writes
/// through one mutex so data and control frames never interleave mid-frame.
#[derive(Clone)]
pub struct TunnelSender {
    sink: WsSink,
    closing: Arc<AtomicBool>,
    max_frame: usize,
}

impl TunnelSender {
    /// Write `data` as one or more ordered binary frames, each at most the
    /// configured max frame size. Blocks on the socket's send window: no
    /// buffering beyond the frame in flight and no silent drops.
    pub async fn send(&self, data: &[u8]) -> Result<(), ProxyError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ProxyError::Transport("send on a closing tunnel".into()));
        }
        let mut sink = self.sink.lock().await;
        for chunk in data.chunks(self.max_frame) {
            sink.send(Message::Binary(chunk.to_vec().into()))
                .await
                .map_err(map_ws_error)?;
        }
        Ok(())
    }

    /// Emit one ping frame.
    pub async fn ping(&self) -> Result<(), ProxyError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ProxyError::Transport("ping on a closing tunnel".into()));
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Ping(Vec::new().into()))
            .await
            .map_err(map_ws_error)
    }

    /// Initiate a graceful close. Further sends are rejected. The peer's
    /// close reply is consumed by [`TunnelReceiver::drain`].
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            trace!("close frame not delivered: {e}");
        }
    }
}

/// Receive side of a tunnel. Single reader; pongs (and any other inbound
/// traffic) refresh the liveness clock shared with the keepalive task.
pub struct TunnelReceiver {
    stream: SplitStream<WsStream>,
    liveness: Arc<Mutex<Instant>>,
    closed: bool,
}

impl TunnelReceiver {
    /// Clock refreshed on every inbound frame, observed by [`ping_loop`].
    pub fn liveness(&self) -> Arc<Mutex<Instant>> {
        Arc::clone(&self.liveness)
    }

    /// Yield the next binary payload or the terminal close event. Control
    /// frames are filtered inline; a text frame is a protocol error.
    pub async fn recv(&mut self) -> Result<TunnelEvent, ProxyError> {
        if self.closed {
            return Err(ProxyError::Transport("recv on a closed tunnel".into()));
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(payload))) => {
                    self.touch().await;
                    return Ok(TunnelEvent::Data(payload.to_vec()));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    self.touch().await;
                }
                Some(Ok(Message::Text(_))) => {
                    return Err(ProxyError::Transport(
                        "unexpected text frame on binary tunnel".into(),
                    ));
                }
                Some(Ok(Message::Close(frame))) => {
                    self.closed = true;
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Ok(TunnelEvent::Closed { code, reason });
                }
                Some(Ok(Message::Frame(_))) => {
                    // Raw frames never surface outside the protocol layer.
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    self.closed = true;
                    return Ok(TunnelEvent::Closed {
                        code: None,
                        reason: "connection closed".into(),
                    });
                }
                Some(Err(e)) => return Err(map_ws_error(e)),
            }
        }
    }

    /// Consume frames until the peer's close (or an error), bounded by
    /// `deadline`. Used after [`TunnelSender::close`] to finish the closing
    /// handshake without blocking teardown forever.
    pub async fn drain(mut self, deadline: Duration) {
        let _ = tokio::time::timeout(deadline, async {
            while !self.closed {
                match self.recv().await {
                    Ok(TunnelEvent::Closed { .. }) | Err(_) => break,
                    Ok(TunnelEvent::Data(d)) => {
                        trace!("discarding {} bytes received while draining", d.len());
                    }
                }
            }
        })
        .await;
    }

    async fn touch(&self) {
        *self.liveness.lock().await = Instant::now();
    }
}

/// Keepalive task: one ping per `interval`; if nothing (pong or data) arrives
/// within `pong_deadline` the tunnel is declared dead.
pub async fn ping_loop(
    sender: TunnelSender,
    liveness: Arc<Mutex<Instant>>,
    interval: Duration,
    pong_deadline: Duration,
    mut stop: StopHandle,
) -> Result<(), ProxyError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            _ = stop.stopped() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let idle = liveness.lock().await.elapsed();
        if idle > pong_deadline {
            warn!(
                "no tunnel traffic for {:.0}s (deadline {:.0}s)",
                idle.as_secs_f64(),
                pong_deadline.as_secs_f64()
            );
            return Err(ProxyError::TunnelTimeout);
        }
        sender.ping().await?;
    }
}

fn map_ws_error(e: WsError) -> ProxyError {
    match e {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            let message = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "upgrade rejected".to_string());
            ProxyError::Handshake {
                status: Some(status),
                message,
            }
        }
        other => ProxyError::Transport(format!("websocket error: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;

    async fn ws_pair(
        max_frame: usize,
    ) -> (
        Tunnel,
        WebSocketStream<TcpStream>,
    ) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio_tungstenite::accept_async(stream).await.expect("ws accept")
        });
        let tunnel = Tunnel::open(
            &format!("ws://{addr}"),
            "test-token",
            true,
            Duration::from_secs(5),
            max_frame,
        )
        .await
        .expect("open");
        (tunnel, server.await.expect("server task"))
    }

    #[tokio::test]
    async fn large_payloads_are_split_into_ordered_bounded_frames() {
        let (tunnel, mut server) = ws_pair(1024).await;
        let (sender, _receiver) = tunnel.split();

        let payload: Vec<u8> = (0..4096 + 100).map(|i| (i % 251) as u8).collect();
        sender.send(&payload).await.expect("send");
        sender.close().await;

        let mut frames = Vec::new();
        while let Some(Ok(msg)) = server.next().await {
            match msg {
                Message::Binary(b) => frames.push(b.to_vec()),
                Message::Close(_) => break,
                _ => {}
            }
        }
        assert_eq!(frames.len(), 5);
        assert!(frames.iter().all(|f| f.len() <= 1024));
        assert_eq!(frames.concat(), payload);
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (tunnel, _server) = ws_pair(1024).await;
        let (sender, _receiver) = tunnel.split();
        sender.close().await;
        assert!(sender.send(b"late").await.is_err());
        assert!(sender.ping().await.is_err());
    }

    #[tokio::test]
    async fn text_frames_are_protocol_errors() {
        let (tunnel, mut server) = ws_pair(1024).await;
        let (_sender, mut receiver) = tunnel.split();
        server
            .send(Message::Text("nope".into()))
            .await
            .expect("server send");
        assert!(receiver.recv().await.is_err());
    }

    #[tokio::test]
    async fn peer_close_is_terminal_and_delivered_once() {
        let (tunnel, mut server) = ws_pair(1024).await;
        let (_sender, mut receiver) = tunnel.split();
        server
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "going away".into(),
            })))
            .await
            .expect("server close");

        match receiver.recv().await.expect("close event") {
            TunnelEvent::Closed { code, reason } => {
                assert_eq!(code, Some(1001));
                assert_eq!(reason, "going away");
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert!(receiver.recv().await.is_err());
    }

    #[tokio::test]
    async fn ping_loop_times_out_when_the_peer_goes_silent() {
        let (tunnel, server) = ws_pair(1024).await;
        let (sender, receiver) = tunnel.split();
        // Hold the server socket open without reading: no pongs come back.
        let _parked = server;

        let shutdown = Shutdown::new();
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            ping_loop(
                sender,
                receiver.liveness(),
                Duration::from_millis(100),
                Duration::from_millis(300),
                shutdown.handle(),
            ),
        )
        .await
        .expect("ping loop finished in time");
        assert!(matches!(result, Err(ProxyError::TunnelTimeout)));
    }

    #[tokio::test]
    async fn ping_loop_stops_cooperatively() {
        let (tunnel, mut server) = ws_pair(1024).await;
        let (sender, receiver) = tunnel.split();
        // Echo server keeps the liveness clock fresh by ponging.
        tokio::spawn(async move { while server.next().await.is_some() {} });

        let shutdown = Shutdown::new();
        let handle = shutdown.handle();
        let task = tokio::spawn(ping_loop(
            sender,
            receiver.liveness(),
            Duration::from_millis(50),
            Duration::from_secs(10),
            handle,
        ));
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("joined")
            .expect("no panic");
        assert!(result.is_ok());
    }
}
