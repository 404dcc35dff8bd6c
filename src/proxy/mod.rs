//! Proxy engine: session state machine, supervision, reconnect policy.
//!
//! The engine owns one [`Session`] end to end: authenticate, resolve the
//! device, open the tunnel, serve one TCP client at a time, tear down. Two
//! pump tasks and the keepalive task run per attachment; the supervisor is
//! the only place session state changes, and all tasks observe one
//! cancellation event per scope.
//!
//! Reconnect policy: while the tunnel is idle, server-initiated closes are
//! absorbed and the tunnel is re-opened with exponential backoff (1 s
//! doubling to 30 s, attempts bounded by `--reconnects`, 0 = unlimited).
//! Once a client is attached, a tunnel failure ends the whole session,
//! because a live remote-interactive session cannot be resumed.

pub mod listener;
pub mod pump;

use std::fmt;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cloud::CloudClient;
use crate::config::{Credentials, ProxyConfig};
use crate::error::ProxyError;
use crate::shutdown::{Shutdown, StopHandle};
use crate::tunnel::{self, Tunnel, TunnelEvent, TunnelReceiver, TunnelSender};

use listener::{ClientLink, ProxyListener};
use pump::PumpEnd;

/// First idle-reconnect delay; doubles up to [`RECONNECT_MAX_DELAY`].
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
/// How long teardown waits for a pump to hand its socket half back.
const PUMP_JOIN_GRACE: Duration = Duration::from_secs(1);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Init,
    Auth,
    Resolving,
    TunnelConnecting,
    TunnelOpenIdle,
    TunnelOpenAttached,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::Auth => "AUTH",
            SessionState::Resolving => "RESOLVING",
            SessionState::TunnelConnecting => "TUNNEL_CONNECTING",
            SessionState::TunnelOpenIdle => "TUNNEL_OPEN_IDLE",
            SessionState::TunnelOpenAttached => "TUNNEL_OPEN_ATTACHED",
            SessionState::Draining => "DRAINING",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// One end-to-end bridge instance, exclusively owned by the engine.
struct Session {
    device: String,
    state: SessionState,
    idle_reconnects: u64,
    started: Instant,
}

impl Session {
    fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            state: SessionState::Init,
            idle_reconnects: 0,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, next: SessionState) {
        if self.state != next {
            debug!("session {}: {} -> {}", self.device, self.state, next);
            self.state = next;
        }
    }
}

/// How an attachment ended, as decided by the supervisor.
enum AttachedEnd {
    /// Stop event fired; receiver returned when a graceful tunnel close is
    /// still possible.
    Stopped { receiver: Option<TunnelReceiver> },
    /// The tunnel died under the client. Fatal.
    TunnelLost,
    /// The client detached (EOF, idle timeout, or local error).
    ClientDone { receiver: Option<TunnelReceiver> },
}

/// Supervisor verdict derived from whichever task finished first.
#[derive(Clone, Copy)]
enum Verdict {
    Stopped,
    TunnelLost,
    ClientDone,
}

/// What woke the supervisor up while the tunnel was idle.
enum IdleEvent {
    Stopped,
    Accepted(Result<ClientLink, ProxyError>),
    Tunnel(Result<TunnelEvent, ProxyError>),
    KeepaliveEnded(Option<ProxyError>),
}

/// The proxy engine. Orchestrates cloud client, tunnel, and listener.
pub struct ProxyEngine {
    device: String,
    credentials: Credentials,
    config: ProxyConfig,
    shutdown: Shutdown,
}

impl ProxyEngine {
    pub fn new(
        device: impl Into<String>,
        credentials: Credentials,
        config: ProxyConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            device: device.into(),
            credentials,
            config,
            shutdown,
        }
    }

    /// Run the session until it closes. `ready` fires with the bound local
    /// port once the listener is up. A clean stop returns `Ok(())`; fatal
    /// errors carry their exit code.
    pub async fn run(self, ready: Option<oneshot::Sender<u16>>) -> Result<(), ProxyError> {
        let mut stop = self.shutdown.handle();
        let mut session = Session::new(&self.device);

        if let Some(deadline) = self.config.session_deadline {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!("session deadline reached, stopping");
                shutdown.stop();
            });
        }

        let result = self.drive(&mut session, &mut stop, ready).await;
        session.enter(SessionState::Draining);
        session.enter(SessionState::Closed);
        info!(
            "session for {} closed after {:.1}s ({} idle reconnects)",
            session.device,
            session.started.elapsed().as_secs_f64(),
            session.idle_reconnects
        );
        result
    }

    async fn drive(
        &self,
        session: &mut Session,
        stop: &mut StopHandle,
        ready: Option<oneshot::Sender<u16>>,
    ) -> Result<(), ProxyError> {
        // AUTH
        session.enter(SessionState::Auth);
        let cloud = CloudClient::new(self.credentials.clone(), self.config.verify_tls)?;
        let token = tokio::select! {
            _ = stop.stopped() => return Ok(()),
            result = tokio::time::timeout(self.config.login_deadline, cloud.login()) => {
                result.map_err(|_| ProxyError::Transport("login deadline exceeded".into()))??
            }
        };
        info!("authenticated against {}", self.credentials.host);

        // RESOLVING
        session.enter(SessionState::Resolving);
        let Some(device_id) = self
            .retry_rest(stop, || {
                cloud.resolve_device(&token, &self.device, &self.config.external_type)
            })
            .await?
        else {
            return Ok(());
        };
        let Some(tunnel_url) = self
            .retry_rest(stop, || {
                cloud.tunnel_url(
                    &token,
                    &self.device,
                    &device_id,
                    self.config.config_name.as_deref(),
                )
            })
            .await?
        else {
            return Ok(());
        };
        info!("device {} resolved (id {})", self.device, device_id);

        // First tunnel, then the listener.
        session.enter(SessionState::TunnelConnecting);
        let Some(mut current) = self
            .connect_tunnel(session, &tunnel_url, &token, stop, false)
            .await?
        else {
            return Ok(());
        };

        let listener = ProxyListener::bind(self.config.bind_port).await?;
        info!(
            "listening on 127.0.0.1:{} for {}",
            listener.local_port(),
            self.device
        );
        if let Some(tx) = ready {
            let _ = tx.send(listener.local_port());
        }

        loop {
            let (sender, mut receiver) = current.split();
            let mut keepalive = tokio::spawn(tunnel::ping_loop(
                sender.clone(),
                receiver.liveness(),
                self.config.ping_interval,
                self.config.pong_deadline,
                stop.clone(),
            ));

            session.enter(SessionState::TunnelOpenIdle);
            let link = loop {
                let event = tokio::select! {
                    _ = stop.stopped() => IdleEvent::Stopped,
                    accepted = listener.accept() => IdleEvent::Accepted(accepted),
                    event = receiver.recv() => IdleEvent::Tunnel(event),
                    end = &mut keepalive => IdleEvent::KeepaliveEnded(match end {
                        Ok(Err(e)) => Some(e),
                        _ => None,
                    }),
                };
                match event {
                    IdleEvent::Stopped => {
                        keepalive.abort();
                        sender.close().await;
                        receiver.drain(self.config.shutdown_grace).await;
                        return Ok(());
                    }
                    IdleEvent::Accepted(Ok(link)) => break Some(link),
                    IdleEvent::Accepted(Err(e)) => warn!("accept failed: {e}"),
                    IdleEvent::Tunnel(Ok(TunnelEvent::Data(payload))) => {
                        debug!(
                            "discarding {} tunnel bytes with no client attached",
                            payload.len()
                        );
                    }
                    IdleEvent::Tunnel(Ok(TunnelEvent::Closed { code, reason })) => {
                        keepalive.abort();
                        info!("tunnel closed while idle (code {code:?}, reason {reason:?})");
                        break None;
                    }
                    IdleEvent::Tunnel(Err(e)) => {
                        keepalive.abort();
                        warn!("tunnel failed while idle: {e}");
                        break None;
                    }
                    IdleEvent::KeepaliveEnded(error) => {
                        if let Some(e) = error {
                            warn!("tunnel keepalive failed while idle: {e}");
                        }
                        break None;
                    }
                }
            };

            let Some(link) = link else {
                // Idle reconnect: absorb the failure and re-open.
                session.enter(SessionState::TunnelConnecting);
                match self
                    .connect_tunnel(session, &tunnel_url, &token, stop, true)
                    .await?
                {
                    Some(t) => {
                        current = t;
                        continue;
                    }
                    None => return Ok(()),
                }
            };

            session.enter(SessionState::TunnelOpenAttached);
            info!("client {} attached", link.peer);
            let end = self
                .attached(link, &sender, receiver, &mut keepalive, &listener, stop)
                .await;
            keepalive.abort();

            match end {
                AttachedEnd::Stopped { receiver } => {
                    sender.close().await;
                    if let Some(r) = receiver {
                        r.drain(self.config.shutdown_grace).await;
                    }
                    return Ok(());
                }
                AttachedEnd::TunnelLost => {
                    return Err(ProxyError::TunnelClosedWhileAttached);
                }
                AttachedEnd::ClientDone { receiver } => {
                    sender.close().await;
                    if let Some(r) = receiver {
                        r.drain(self.config.shutdown_grace).await;
                    }
                    if !self.config.reuse {
                        return Ok(());
                    }
                    // Server mode: a fresh tunnel for the next client.
                    session.enter(SessionState::TunnelConnecting);
                    match self
                        .connect_tunnel(session, &tunnel_url, &token, stop, false)
                        .await?
                    {
                        Some(t) => {
                            current = t;
                            continue;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// One attachment: spawn the pumps, reject surplus clients, and turn the
    /// first completion into a [`Verdict`].
    async fn attached(
        &self,
        link: ClientLink,
        sender: &TunnelSender,
        receiver: TunnelReceiver,
        keepalive: &mut JoinHandle<Result<(), ProxyError>>,
        listener: &ProxyListener,
        stop: &mut StopHandle,
    ) -> AttachedEnd {
        let peer = link.peer;
        let bytes_up = link.bytes_up.clone();
        let bytes_down = link.bytes_down.clone();
        let (read_half, write_half) = link.into_split();

        let attachment = Shutdown::new();
        let mut up = tokio::spawn(pump::tcp_to_tunnel(
            read_half,
            sender.clone(),
            self.config.max_frame_size,
            self.config.tcp_idle_timeout,
            bytes_up.clone(),
            attachment.handle(),
        ));
        let mut down = tokio::spawn(pump::tunnel_to_tcp(
            receiver,
            write_half,
            bytes_down.clone(),
            attachment.handle(),
        ));

        let mut up_out: Option<(PumpEnd, OwnedReadHalf)> = None;
        let mut down_out: Option<(PumpEnd, OwnedWriteHalf, TunnelReceiver)> = None;
        let mut keepalive_done = false;

        let verdict = loop {
            tokio::select! {
                _ = stop.stopped() => break Verdict::Stopped,
                surplus = listener.accept() => {
                    if let Ok(extra) = surplus {
                        info!(
                            "rejecting client {} (a client is already attached)",
                            extra.peer
                        );
                        extra.reject();
                    }
                }
                joined = &mut up, if up_out.is_none() => match joined {
                    Ok(out) => {
                        let verdict = match &out.0 {
                            PumpEnd::TunnelError(_) => Some(Verdict::TunnelLost),
                            PumpEnd::LocalEof
                            | PumpEnd::IdleTimeout
                            | PumpEnd::LocalError(_)
                            | PumpEnd::Cancelled => Some(Verdict::ClientDone),
                            PumpEnd::TunnelClosed { .. } => Some(Verdict::TunnelLost),
                        };
                        debug!("client read loop ended: {:?}", out.0);
                        up_out = Some(out);
                        if let Some(v) = verdict {
                            break v;
                        }
                    }
                    Err(_) => break Verdict::ClientDone,
                },
                joined = &mut down, if down_out.is_none() => match joined {
                    Ok(out) => {
                        let verdict = match &out.0 {
                            PumpEnd::TunnelClosed { .. } | PumpEnd::TunnelError(_) => {
                                Some(Verdict::TunnelLost)
                            }
                            PumpEnd::LocalEof
                            | PumpEnd::IdleTimeout
                            | PumpEnd::LocalError(_)
                            | PumpEnd::Cancelled => Some(Verdict::ClientDone),
                        };
                        debug!("tunnel read loop ended: {:?}", out.0);
                        down_out = Some(out);
                        if let Some(v) = verdict {
                            break v;
                        }
                    }
                    Err(_) => break Verdict::TunnelLost,
                },
                end = &mut *keepalive, if !keepalive_done => {
                    keepalive_done = true;
                    if let Ok(Err(e)) = end {
                        warn!("tunnel keepalive failed: {e}");
                        break Verdict::TunnelLost;
                    }
                }
            }
        };

        // Teardown: cancel the surviving pump, collect the socket halves.
        attachment.stop();
        if up_out.is_none() {
            up_out = match tokio::time::timeout(PUMP_JOIN_GRACE, &mut up).await {
                Ok(Ok(out)) => Some(out),
                _ => {
                    up.abort();
                    None
                }
            };
        }
        if down_out.is_none() {
            down_out = match tokio::time::timeout(PUMP_JOIN_GRACE, &mut down).await {
                Ok(Ok(out)) => Some(out),
                _ => {
                    down.abort();
                    None
                }
            };
        }

        let read_half = up_out.map(|(_, half)| half);
        let (write_half, receiver) = match down_out {
            Some((_, half, receiver)) => (Some(half), Some(receiver)),
            None => (None, None),
        };
        let stream = match (read_half, write_half) {
            (Some(r), Some(w)) => r.reunite(w).ok(),
            _ => None,
        };

        info!(
            "client {} detached ({} B up, {} B down)",
            peer,
            bytes_up.load(Ordering::Relaxed),
            bytes_down.load(Ordering::Relaxed)
        );

        match verdict {
            Verdict::TunnelLost => {
                // The remote session is gone; make the client fail fast.
                if let Some(stream) = stream {
                    listener::reset(stream, peer);
                }
                AttachedEnd::TunnelLost
            }
            Verdict::ClientDone => {
                drop(stream);
                AttachedEnd::ClientDone { receiver }
            }
            Verdict::Stopped => {
                drop(stream);
                AttachedEnd::Stopped { receiver }
            }
        }
    }

    /// Open the tunnel, retrying transient failures with exponential backoff.
    /// With `reconnecting` the attempts count against the `--reconnects`
    /// budget and every attempt (including the first) waits out the backoff,
    /// since the previous tunnel just died. Returns `Ok(None)` on stop.
    async fn connect_tunnel(
        &self,
        session: &mut Session,
        url: &str,
        token: &str,
        stop: &mut StopHandle,
        reconnecting: bool,
    ) -> Result<Option<Tunnel>, ProxyError> {
        let mut delay = RECONNECT_INITIAL_DELAY;
        let mut first = true;
        loop {
            if reconnecting {
                session.idle_reconnects += 1;
                let budget = self.config.max_reconnects;
                if budget > 0 && session.idle_reconnects > budget {
                    return Err(ProxyError::Transport(format!(
                        "gave up re-opening the tunnel after {budget} attempts"
                    )));
                }
            }
            if reconnecting || !first {
                tokio::select! {
                    _ = stop.stopped() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            first = false;
            if stop.is_stopped() {
                return Ok(None);
            }

            match Tunnel::open(
                url,
                token,
                self.config.verify_tls,
                self.config.connect_timeout,
                self.config.max_frame_size,
            )
            .await
            {
                Ok(tunnel) => {
                    if reconnecting {
                        info!(
                            "tunnel re-established (attempt {})",
                            session.idle_reconnects
                        );
                    }
                    return Ok(Some(tunnel));
                }
                Err(e) if e.is_transient() || reconnecting => {
                    warn!(
                        "tunnel connect failed: {e}, retrying in {}s",
                        delay.as_secs()
                    );
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bounded-backoff retry for cloud REST calls during session
    /// establishment. Only transient kinds are retried. Returns `Ok(None)`
    /// on stop.
    async fn retry_rest<T, F, Fut>(
        &self,
        stop: &mut StopHandle,
        op: F,
    ) -> Result<Option<T>, ProxyError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProxyError>>,
    {
        let mut delay = RECONNECT_INITIAL_DELAY;
        let mut attempts = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_transient() && attempts < 3 => {
                    attempts += 1;
                    warn!("cloud request failed: {e}, retrying in {}s", delay.as_secs());
                    tokio::select! {
                        _ = stop.stopped() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
