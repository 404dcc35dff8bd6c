//! Error taxonomy for the local proxy.
//!
//! Every failure the proxy can surface to the user is one of the kinds below.
//! The mapping to process exit codes lives here too, so `main` only has to
//! call [`ProxyError::exit_code`]. Transient kinds (network hiccups, 5xx from
//! the cloud) are retried with bounded backoff while the session is still
//! being established; everything else is fatal.

use std::fmt;

/// Errors surfaced by the proxy engine and its collaborators.
#[derive(Debug)]
pub enum ProxyError {
    /// Missing or invalid configuration input (bad host URL, missing flag).
    Config(String),
    /// The cloud rejected the supplied credentials or token.
    Auth(String),
    /// The cloud demands a two-factor code that was not supplied.
    TfaRequired,
    /// No device matches the given external identity.
    DeviceNotFound(String),
    /// More than one device matches the given name.
    DeviceAmbiguous(String),
    /// DNS/TCP/TLS failure or HTTP 5xx talking to the cloud.
    Transport(String),
    /// The WebSocket upgrade was rejected.
    Handshake {
        status: Option<u16>,
        message: String,
    },
    /// No pong (or any traffic) from the tunnel within the configured deadline.
    TunnelTimeout,
    /// The tunnel closed while a TCP client was attached. Not recoverable:
    /// the remote interactive session cannot be resumed.
    TunnelClosedWhileAttached,
    /// Local TCP socket error. Ends the attachment, not necessarily the session.
    Client(std::io::Error),
    /// The local listener could not bind its port.
    Bind(std::io::Error),
}

impl ProxyError {
    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProxyError::Config(_) => 2,
            ProxyError::Auth(_) | ProxyError::TfaRequired => 3,
            ProxyError::DeviceNotFound(_) | ProxyError::DeviceAmbiguous(_) => 4,
            ProxyError::TunnelClosedWhileAttached => 5,
            ProxyError::Bind(_) => 6,
            _ => 1,
        }
    }

    /// Whether the failure is worth retrying with backoff during session
    /// establishment. Auth and resolution failures never are.
    pub fn is_transient(&self) -> bool {
        match self {
            ProxyError::Transport(_) => true,
            ProxyError::Handshake {
                status: Some(code), ..
            } => (500..600).contains(code),
            _ => false,
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Config(msg) => write!(f, "configuration error: {msg}"),
            ProxyError::Auth(msg) => write!(f, "authentication failed: {msg}"),
            ProxyError::TfaRequired => {
                write!(f, "authentication failed: a TFA code is required (--tfa-code)")
            }
            ProxyError::DeviceNotFound(device) => {
                write!(f, "device not found: {device}")
            }
            ProxyError::DeviceAmbiguous(device) => {
                write!(f, "device name matches more than one device: {device}")
            }
            ProxyError::Transport(msg) => write!(f, "transport error: {msg}"),
            ProxyError::Handshake { status, message } => match status {
                Some(code) => write!(f, "tunnel handshake rejected (HTTP {code}): {message}"),
                None => write!(f, "tunnel handshake rejected: {message}"),
            },
            ProxyError::TunnelTimeout => {
                write!(f, "tunnel keepalive timed out waiting for a pong")
            }
            ProxyError::TunnelClosedWhileAttached => {
                write!(f, "tunnel closed while a client was attached")
            }
            ProxyError::Client(e) => write!(f, "client connection error: {e}"),
            ProxyError::Bind(e) => write!(f, "could not bind local port: {e}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Client(e) | ProxyError::Bind(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_documented_mapping() {
        assert_eq!(ProxyError::Config("x".into()).exit_code(), 2);
        assert_eq!(ProxyError::Auth("x".into()).exit_code(), 3);
        assert_eq!(ProxyError::TfaRequired.exit_code(), 3);
        assert_eq!(ProxyError::DeviceNotFound("d".into()).exit_code(), 4);
        assert_eq!(ProxyError::DeviceAmbiguous("d".into()).exit_code(), 4);
        assert_eq!(ProxyError::TunnelClosedWhileAttached.exit_code(), 5);
        assert_eq!(
            ProxyError::Bind(std::io::Error::other("in use")).exit_code(),
            6
        );
        assert_eq!(ProxyError::Transport("x".into()).exit_code(), 1);
        assert_eq!(ProxyError::TunnelTimeout.exit_code(), 1);
    }

    #[test]
    fn only_transport_and_5xx_handshakes_are_transient() {
        assert!(ProxyError::Transport("dns".into()).is_transient());
        assert!(ProxyError::Handshake {
            status: Some(503),
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!ProxyError::Handshake {
            status: Some(401),
            message: "unauthorized".into()
        }
        .is_transient());
        assert!(!ProxyError::Auth("bad".into()).is_transient());
        assert!(!ProxyError::TunnelTimeout.is_transient());
    }
}
