//! CLI entry point.
//!
//! Subcommands:
//!
//! - `c8ylp server <device>` — run the bridge until stopped.
//! - `c8ylp connect ssh <device>` — run the bridge, spawn an ssh client
//!   against the local port, exit when the child exits.
//!
//! Exit codes: 0 clean stop, 1 generic error, 2 bad invocation or
//! configuration, 3 authentication failure, 4 device not found, 5 tunnel
//! closed while a client was attached, 6 local bind failure.

use std::collections::HashMap;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{debug, error};

use c8ylp::config::{self, CommonArgs};
use c8ylp::{Credentials, ProxyConfig, ProxyEngine, ProxyError, Shutdown};

/// Cumulocity remote access local proxy.
#[derive(Parser)]
#[command(name = "c8ylp", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the local proxy and serve clients until stopped
    Server {
        #[command(flatten)]
        args: CommonArgs,
    },
    /// Start a once-off proxy and connect a client through it
    #[command(subcommand)]
    Connect(ConnectCommands),
}

#[derive(Subcommand)]
enum ConnectCommands {
    /// Connect via ssh, shutting the proxy down when ssh exits
    Ssh {
        #[command(flatten)]
        args: CommonArgs,

        /// Username for the ssh connection to the device
        #[arg(long, env = "C8YLP_SSH_USER")]
        ssh_user: Option<String>,

        /// Command to execute on the device instead of an interactive shell
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        remote_command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            debug!("error detail: {e:?}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32, ProxyError> {
    match cli.command {
        Commands::Server { args } => {
            c8ylp::logging::init(args.verbose);
            let (credentials, proxy_config) = load(&args, true)?;
            run_server(&args.device, credentials, proxy_config).await
        }
        Commands::Connect(ConnectCommands::Ssh {
            args,
            ssh_user,
            remote_command,
        }) => {
            c8ylp::logging::init(args.verbose);
            let ssh_user = ssh_user.ok_or_else(|| {
                ProxyError::Config("no ssh user given (--ssh-user or C8YLP_SSH_USER)".into())
            })?;
            let (credentials, proxy_config) = load(&args, false)?;
            run_connect_ssh(
                &args.device,
                credentials,
                proxy_config,
                &ssh_user,
                &remote_command,
            )
            .await
        }
    }
}

/// Resolve credentials and engine config from flags, environment, env file.
fn load(args: &CommonArgs, reuse: bool) -> Result<(Credentials, ProxyConfig), ProxyError> {
    let env_file: HashMap<String, String> = match &args.env_file {
        Some(path) => config::load_env_file(path)?,
        None => HashMap::new(),
    };
    let credentials = Credentials::resolve(args, &env_file)?;
    let proxy_config = ProxyConfig::resolve(args, &env_file, reuse)?;
    debug!("resolved {credentials:?}");
    Ok((credentials, proxy_config))
}

async fn run_server(
    device: &str,
    credentials: Credentials,
    proxy_config: ProxyConfig,
) -> Result<i32, ProxyError> {
    let shutdown = Shutdown::new();
    c8ylp::shutdown::spawn_signal_listener(shutdown.clone());

    let host = credentials.host.clone();
    let (ready_tx, ready_rx) = oneshot::channel();
    let engine = ProxyEngine::new(device, credentials, proxy_config, shutdown.clone());
    let mut engine_task = tokio::spawn(engine.run(Some(ready_tx)));

    let ready = tokio::select! {
        ready = ready_rx => ready.ok(),
        // The engine failed before the listener came up.
        result = &mut engine_task => {
            result.map_err(join_error)??;
            return Ok(0);
        }
    };
    if let Some(port) = ready {
        println!("c8ylp is listening for device {device} ({host}) on localhost:{port}");
        println!("Connect with e.g.:  ssh -p {port} <device_user>@localhost");
    }
    engine_task.await.map_err(join_error)??;
    Ok(0)
}

async fn run_connect_ssh(
    device: &str,
    credentials: Credentials,
    proxy_config: ProxyConfig,
    ssh_user: &str,
    remote_command: &[String],
) -> Result<i32, ProxyError> {
    let shutdown = Shutdown::new();
    c8ylp::shutdown::spawn_signal_listener(shutdown.clone());

    let (ready_tx, ready_rx) = oneshot::channel();
    let engine = ProxyEngine::new(device, credentials, proxy_config, shutdown.clone());
    let mut engine_task = tokio::spawn(engine.run(Some(ready_tx)));

    // Wait for the listener; if the engine dies first, surface its error.
    let ready = tokio::select! {
        ready = ready_rx => Some(ready.ok()),
        result = &mut engine_task => {
            result.map_err(join_error)??;
            None
        }
    };
    let port = match ready {
        Some(Some(port)) => port,
        // The ready channel was dropped: join the engine for its error.
        Some(None) => {
            engine_task.await.map_err(join_error)??;
            return Err(ProxyError::Transport(
                "proxy stopped before the listener came up".into(),
            ));
        }
        // The engine finished cleanly before the listener came up.
        None => {
            return Err(ProxyError::Transport(
                "proxy stopped before the listener came up".into(),
            ));
        }
    };

    let ssh_result = c8ylp::ssh::run_ssh(port, ssh_user, device, remote_command).await;

    shutdown.stop();
    let engine_result = match tokio::time::timeout(Duration::from_secs(10), engine_task).await {
        Ok(joined) => joined.map_err(join_error)?,
        Err(_) => {
            debug!("proxy did not stop within 10s, abandoning it");
            Ok(())
        }
    };

    let code = ssh_result?;
    engine_result?;
    Ok(code)
}

fn join_error(e: tokio::task::JoinError) -> ProxyError {
    ProxyError::Transport(format!("proxy task failed: {e}"))
}
