//! Configuration and credential loading.
//!
//! Values are resolved from three fallback sources (highest wins):
//!
//! 1. **CLI flags** — including their `C8YLP_<FLAG>` environment variables,
//!    which clap folds into the flag value.
//! 2. **Process environment** — cloud credentials additionally read the
//!    `C8Y_HOST`, `C8Y_TENANT`, `C8Y_USER`, `C8Y_PASSWORD`, `C8Y_TOKEN`,
//!    `C8Y_TFA_CODE` variables.
//! 3. **Env file** — a plain `KEY=VALUE` file given via `--env-file`, read
//!    once at startup and never written.
//!
//! The result is an immutable [`Credentials`] snapshot plus a [`ProxyConfig`]
//! for the engine. Secrets never appear in `Debug` output or logs.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;

use crate::error::ProxyError;

/// Flags shared by every subcommand that starts the proxy engine.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Device external identity (e.g. its serial number)
    pub device: String,

    /// Cumulocity host URL, e.g. https://example.c8y.io
    #[arg(long, env = "C8YLP_HOST")]
    pub host: Option<String>,

    /// Cumulocity tenant id
    #[arg(long, env = "C8YLP_TENANT")]
    pub tenant: Option<String>,

    /// Cumulocity username
    #[arg(long, env = "C8YLP_USER")]
    pub user: Option<String>,

    /// Cumulocity password
    #[arg(long, env = "C8YLP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Cumulocity bearer token (skips the password login when valid)
    #[arg(long, env = "C8YLP_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Two-factor authentication code
    #[arg(long, env = "C8YLP_TFA_CODE", hide_env_values = true)]
    pub tfa_code: Option<String>,

    /// External identity type used for the device lookup
    #[arg(long, env = "C8YLP_EXTERNAL_TYPE")]
    pub external_type: Option<String>,

    /// Remote access configuration name (first PASSTHROUGH config if omitted)
    #[arg(long, env = "C8YLP_CONFIG")]
    pub config: Option<String>,

    /// Local TCP port to listen on (0 = OS-chosen)
    #[arg(long, env = "C8YLP_PORT")]
    pub port: Option<u16>,

    /// WebSocket ping interval in seconds
    #[arg(long, env = "C8YLP_PING_INTERVAL")]
    pub ping_interval: Option<u64>,

    /// Maximum bytes per tunnel frame
    #[arg(long, env = "C8YLP_TCP_SIZE")]
    pub tcp_size: Option<usize>,

    /// Idle timeout for the attached TCP client in seconds (0 = disabled)
    #[arg(long, env = "C8YLP_TCP_TIMEOUT")]
    pub tcp_timeout: Option<u64>,

    /// Skip TLS certificate verification (cloud REST and tunnel)
    #[arg(long, env = "C8YLP_SSL_IGNORE_VERIFY")]
    pub ssl_ignore_verify: bool,

    /// Maximum idle tunnel reconnect attempts (0 = unlimited)
    #[arg(long, env = "C8YLP_RECONNECTS")]
    pub reconnects: Option<u64>,

    /// Env file with credentials and flag defaults
    #[arg(long, env = "C8YLP_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Immutable credential snapshot for one session.
#[derive(Clone)]
pub struct Credentials {
    /// Base URL, normalized: always carries a scheme, never a trailing slash.
    pub host: String,
    pub tenant: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub tfa_code: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("tenant", &self.tenant)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("tfa_code", &self.tfa_code.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Credentials {
    /// Build the credential snapshot from flags, environment, and env file.
    pub fn resolve(
        args: &CommonArgs,
        env_file: &HashMap<String, String>,
    ) -> Result<Self, ProxyError> {
        let host = resolve_value(args.host.clone(), &["C8Y_HOST"], env_file)
            .ok_or_else(|| ProxyError::Config("no host given (--host or C8Y_HOST)".into()))?;
        Ok(Self {
            host: normalize_host(&host)?,
            tenant: resolve_value(args.tenant.clone(), &["C8Y_TENANT"], env_file),
            user: resolve_value(args.user.clone(), &["C8Y_USER"], env_file),
            password: resolve_value(args.password.clone(), &["C8Y_PASSWORD"], env_file),
            token: resolve_value(args.token.clone(), &["C8Y_TOKEN"], env_file),
            tfa_code: resolve_value(args.tfa_code.clone(), &["C8Y_TFA_CODE"], env_file),
        })
    }
}

/// Engine configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local bind port (0 = OS-chosen).
    pub bind_port: u16,
    /// Interval between keepalive pings on the tunnel.
    pub ping_interval: Duration,
    /// Tunnel is considered dead after this long without inbound traffic.
    pub pong_deadline: Duration,
    /// Maximum payload bytes per tunnel frame; also the pump read buffer size.
    pub max_frame_size: usize,
    /// Idle timeout for the attached TCP client. `None` = disabled.
    pub tcp_idle_timeout: Option<Duration>,
    /// Deadline for the WebSocket upgrade.
    pub connect_timeout: Duration,
    /// Overall deadline for the cloud login.
    pub login_deadline: Duration,
    /// Optional whole-session deadline.
    pub session_deadline: Option<Duration>,
    /// How long teardown waits for pumps to join before force-closing.
    pub shutdown_grace: Duration,
    /// Idle reconnect budget (0 = unlimited).
    pub max_reconnects: u64,
    /// Verify TLS certificates on the cloud REST and tunnel connections.
    pub verify_tls: bool,
    /// External identity type for the device lookup.
    pub external_type: String,
    /// Remote access configuration name. `None` = first PASSTHROUGH config.
    pub config_name: Option<String>,
    /// Keep accepting new clients after a graceful detach (server mode).
    pub reuse: bool,
}

impl ProxyConfig {
    /// Build the engine configuration from flags and env file. `reuse` is
    /// decided by the subcommand: `server` keeps accepting after a client
    /// detaches, `connect ssh` ends the session with its single client.
    pub fn resolve(
        args: &CommonArgs,
        env_file: &HashMap<String, String>,
        reuse: bool,
    ) -> Result<Self, ProxyError> {
        let port = match args.port {
            Some(p) => p,
            None => parse_or(env_file, "C8YLP_PORT", default_port())?,
        };
        let ping_interval = match args.ping_interval {
            Some(s) => s,
            None => parse_or(env_file, "C8YLP_PING_INTERVAL", default_ping_interval())?,
        };
        let tcp_size = match args.tcp_size {
            Some(s) => s,
            None => parse_or(env_file, "C8YLP_TCP_SIZE", default_tcp_size())?,
        };
        if tcp_size == 0 {
            return Err(ProxyError::Config("--tcp-size must be greater than 0".into()));
        }
        let tcp_timeout = match args.tcp_timeout {
            Some(s) => s,
            None => parse_or(env_file, "C8YLP_TCP_TIMEOUT", 0)?,
        };
        let reconnects = match args.reconnects {
            Some(n) => n,
            None => parse_or(env_file, "C8YLP_RECONNECTS", 0)?,
        };

        Ok(Self {
            bind_port: port,
            ping_interval: Duration::from_secs(ping_interval),
            pong_deadline: Duration::from_secs(default_pong_deadline()),
            max_frame_size: tcp_size,
            tcp_idle_timeout: (tcp_timeout > 0).then(|| Duration::from_secs(tcp_timeout)),
            connect_timeout: Duration::from_secs(default_connect_timeout()),
            login_deadline: Duration::from_secs(default_login_deadline()),
            session_deadline: None,
            shutdown_grace: Duration::from_secs(default_shutdown_grace()),
            max_reconnects: reconnects,
            verify_tls: !args.ssl_ignore_verify,
            external_type: args
                .external_type
                .clone()
                .or_else(|| env_file.get("C8YLP_EXTERNAL_TYPE").cloned())
                .unwrap_or_else(default_external_type),
            config_name: args
                .config
                .clone()
                .or_else(|| env_file.get("C8YLP_CONFIG").cloned()),
            reuse,
        })
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_port: default_port(),
            ping_interval: Duration::from_secs(default_ping_interval()),
            pong_deadline: Duration::from_secs(default_pong_deadline()),
            max_frame_size: default_tcp_size(),
            tcp_idle_timeout: None,
            connect_timeout: Duration::from_secs(default_connect_timeout()),
            login_deadline: Duration::from_secs(default_login_deadline()),
            session_deadline: None,
            shutdown_grace: Duration::from_secs(default_shutdown_grace()),
            max_reconnects: 0,
            verify_tls: true,
            external_type: default_external_type(),
            config_name: None,
            reuse: true,
        }
    }
}

fn default_port() -> u16 {
    2222
}
fn default_ping_interval() -> u64 {
    30
}
fn default_pong_deadline() -> u64 {
    60
}
fn default_tcp_size() -> usize {
    16 * 1024
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_login_deadline() -> u64 {
    60
}
fn default_shutdown_grace() -> u64 {
    5
}
fn default_external_type() -> String {
    "c8y_Serial".to_string()
}

/// Read an env file into a map. Blank lines and `#` comments are skipped;
/// a leading `export ` and single/double quotes around values are stripped.
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>, ProxyError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Config(format!("could not read env file {}: {e}", path.display()))
    })?;
    Ok(parse_env_file(&contents))
}

fn parse_env_file(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// Resolution chain for one value: explicit argument, then each key in the
/// process environment, then each key in the env file.
fn resolve_value(
    explicit: Option<String>,
    keys: &[&str],
    env_file: &HashMap<String, String>,
) -> Option<String> {
    if let Some(v) = explicit.filter(|v| !v.is_empty()) {
        return Some(v);
    }
    for key in keys {
        if let Ok(v) = std::env::var(key) {
            if !v.is_empty() {
                return Some(v);
            }
        }
    }
    for key in keys {
        if let Some(v) = env_file.get(*key) {
            if !v.is_empty() {
                return Some(v.clone());
            }
        }
    }
    None
}

/// Numeric env-file lookup with a default; a malformed value is a hard
/// configuration error rather than a silent fallback.
fn parse_or<T: std::str::FromStr>(
    env_file: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ProxyError> {
    match env_file.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ProxyError::Config(format!("invalid value for {key}: {raw}"))),
        None => Ok(default),
    }
}

/// Normalize the host URL: default to https when no scheme is given, reject
/// anything that is not http(s), strip the trailing slash.
fn normalize_host(host: &str) -> Result<String, ProxyError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ProxyError::Config("host URL is empty".into()));
    }
    let with_scheme = if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{host}")
    };
    let url = reqwest::Url::parse(&with_scheme)
        .map_err(|e| ProxyError::Config(format!("invalid host URL {host}: {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ProxyError::Config(format!(
                "unsupported host URL scheme: {other}"
            )))
        }
    }
    Ok(with_scheme.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_file_parsing_handles_comments_quotes_and_export() {
        let parsed = parse_env_file(
            "# credentials\n\
             C8Y_HOST=https://example.c8y.io\n\
             export C8Y_USER=alice\n\
             C8Y_PASSWORD=\"s3cret=with=equals\"\n\
             C8Y_TENANT='t100'\n\
             \n\
             not a pair\n",
        );
        assert_eq!(parsed["C8Y_HOST"], "https://example.c8y.io");
        assert_eq!(parsed["C8Y_USER"], "alice");
        assert_eq!(parsed["C8Y_PASSWORD"], "s3cret=with=equals");
        assert_eq!(parsed["C8Y_TENANT"], "t100");
        assert!(!parsed.contains_key("not a pair"));
    }

    #[test]
    fn explicit_argument_wins_over_env_file() {
        let mut file = HashMap::new();
        file.insert("C8YLP_TEST_ONLY_KEY".to_string(), "from-file".to_string());
        let v = resolve_value(
            Some("from-flag".to_string()),
            &["C8YLP_TEST_ONLY_KEY"],
            &file,
        );
        assert_eq!(v.as_deref(), Some("from-flag"));
        let v = resolve_value(None, &["C8YLP_TEST_ONLY_KEY"], &file);
        assert_eq!(v.as_deref(), Some("from-file"));
    }

    #[test]
    fn empty_values_fall_through() {
        let mut file = HashMap::new();
        file.insert("C8YLP_TEST_FALLTHROUGH".to_string(), "deep".to_string());
        let v = resolve_value(Some(String::new()), &["C8YLP_TEST_FALLTHROUGH"], &file);
        assert_eq!(v.as_deref(), Some("deep"));
    }

    #[test]
    fn host_normalization() {
        assert_eq!(
            normalize_host("example.c8y.io").unwrap(),
            "https://example.c8y.io"
        );
        assert_eq!(
            normalize_host("https://example.c8y.io/").unwrap(),
            "https://example.c8y.io"
        );
        assert_eq!(
            normalize_host("http://127.0.0.1:8080").unwrap(),
            "http://127.0.0.1:8080"
        );
        assert!(normalize_host("ftp://example.com").is_err());
        assert!(normalize_host("").is_err());
        assert!(normalize_host("https://exa mple").is_err());
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let creds = Credentials {
            host: "https://example.c8y.io".into(),
            tenant: Some("t100".into()),
            user: Some("alice".into()),
            password: Some("hunter2".into()),
            token: Some("tok-abc".into()),
            tfa_code: Some("123456".into()),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("tok-abc"));
        assert!(!rendered.contains("123456"));
        assert!(rendered.contains("alice"));
    }

    #[test]
    fn malformed_numeric_env_file_value_is_a_config_error() {
        let mut file = HashMap::new();
        file.insert("C8YLP_PORT".to_string(), "not-a-port".to_string());
        let err = parse_or::<u16>(&file, "C8YLP_PORT", 2222).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
