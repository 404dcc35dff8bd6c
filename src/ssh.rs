//! Spawns the ssh client for `connect ssh`.
//!
//! The proxy terminates TLS and authentication against the cloud, so the ssh
//! connection itself goes to `localhost:<port>`; host key checking is
//! disabled because the local port maps to a different device every run.

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::ProxyError;

/// Run ssh against the local proxy port and return its exit code. With a
/// non-empty `remote_command` the command is executed once and ssh exits;
/// otherwise an interactive session is opened.
pub async fn run_ssh(
    port: u16,
    ssh_user: &str,
    device: &str,
    remote_command: &[String],
) -> Result<i32, ProxyError> {
    let mut command = Command::new("ssh");
    command
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null")
        .arg("-p")
        .arg(port.to_string())
        .arg(format!("{ssh_user}@localhost"));
    command.args(remote_command);

    if remote_command.is_empty() {
        info!("starting interactive ssh session with {device}");
    } else {
        info!("executing command on {device} via ssh");
    }

    let status = command.status().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProxyError::Config("ssh client not found in PATH".into())
        } else {
            ProxyError::Client(e)
        }
    })?;

    let code = status.code().unwrap_or(1);
    if code != 0 {
        warn!("ssh exited with code {code}");
    }
    Ok(code)
}
