use anyhow::Result;
use pipesecret::config::SOCKET_ENV;
use pipesecret_item::{JqEngine, OnePasswordCli, SecretResolver};
use pipesecret_relay::bridge::BridgeConfig;
use pipesecret_relay::controller::{Controller, SessionCommand};
use pipesecret_relay::remote::RemoteServer;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ServeOptions {
    pub host: String,
    pub ssh: String,
    pub remote_command: String,
    pub op: String,
    pub socket: PathBuf,
}

/// Controller side: run `ssh <host> <command>` and answer lookups from it
/// until the session ends or ctrl-c.
pub async fn serve(opts: ServeOptions) -> Result<()> {
    let source = OnePasswordCli::new(opts.op.as_str());
    match source.locate() {
        Some(path) => info!(op = %path.display(), "using 1Password CLI"),
        None => warn!(op = %opts.op, "1Password CLI not found, lookups will fail until it is installed"),
    }

    let command = SessionCommand::ssh(&opts.ssh, &opts.host, &opts.remote_command)
        .env(SOCKET_ENV, opts.socket.to_string_lossy());
    info!(host = %opts.host, command = %opts.remote_command, "starting remote session");

    Controller::new(command, SecretResolver::new(source, JqEngine))
        .run(ctrl_c())
        .await
}

/// Remote side: bridge the local socket to the controller over this
/// process's stdin/stdout.
pub async fn remote_serve(config: BridgeConfig, heartbeat: Duration) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            ctrl_c().await;
            cancel.cancel();
        }
    });

    let result = RemoteServer::new(config, heartbeat)
        .run(tokio::io::stdin(), tokio::io::stdout(), cancel)
        .await;
    on_ctrl_c.abort();
    result
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c, shutting down"),
        Err(e) => {
            warn!(err = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}
