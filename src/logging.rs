//! Logging setup.
//!
//! Two `tracing` layers: a compact console layer on stderr and an append-only
//! file layer under `~/.c8ylp/localproxy.log` (rotation is external). The
//! default filter follows `-v` (warn → info → debug); `RUST_LOG` overrides it.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize global logging. Safe to call once per process; errors opening
/// the log file degrade to console-only logging.
pub fn init(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match open_log_file() {
        Some(file) => {
            let file_layer = fmt::layer().with_ansi(false).with_writer(Arc::new(file));
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
        }
    }
}

/// Open `~/.c8ylp/localproxy.log` for appending, creating the directory if
/// needed. Returns `None` (console-only logging) when the home directory is
/// unknown or the file cannot be opened.
fn open_log_file() -> Option<std::fs::File> {
    let dir = log_dir()?;
    if std::fs::create_dir_all(&dir).is_err() {
        return None;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("localproxy.log"))
        .ok()
}

fn log_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".c8ylp"))
}
