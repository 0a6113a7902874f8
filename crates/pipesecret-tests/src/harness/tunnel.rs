use super::init_tracing;
use super::items::{FakeItems, ItemStats};
use anyhow::{Context, Result};
use pipesecret_item::{JqEngine, SecretResolver};
use pipesecret_relay::bridge::{Bridge, BridgeConfig};
use pipesecret_relay::remote;
use pipesecret_relay::server::RelayServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub heartbeat: Duration,
    pub shutdown_grace: Duration,
    pub call_timeout: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(50),
            call_timeout: Duration::from_secs(5),
        }
    }
}

pub(crate) fn bind_bridge(opts: &TunnelOptions) -> Result<(Bridge, PathBuf, TempDir)> {
    let socket_dir = TempDir::new()?;
    let socket_path = socket_dir.path().join("pipesecret.sock");
    let bridge = Bridge::bind(BridgeConfig {
        socket_path: socket_path.clone(),
        shutdown_grace: opts.shutdown_grace,
        call_timeout: opts.call_timeout,
    })
    .context("failed to bind test bridge")?;
    Ok((bridge, socket_path, socket_dir))
}

/// Both halves of pipesecret joined by an in-memory duplex pipe: the
/// remote side (bridge + relay client) and the controller side (relay
/// server resolving items from a [`FakeItems`] with jq).
pub struct TestTunnel {
    pub socket_path: PathBuf,
    pub stats: Arc<ItemStats>,
    remote_cancel: CancellationToken,
    controller_cancel: CancellationToken,
    remote: Option<JoinHandle<Result<()>>>,
    controller: Option<JoinHandle<Result<(), pipesecret_relay::RelayError>>>,
    _socket_dir: TempDir,
}

impl TestTunnel {
    pub async fn spawn(items: FakeItems) -> Result<Self> {
        Self::spawn_with(items, TunnelOptions::default()).await
    }

    pub async fn spawn_with(items: FakeItems, opts: TunnelOptions) -> Result<Self> {
        init_tracing();
        let (bridge, socket_path, socket_dir) = bind_bridge(&opts)?;

        let (remote_end, controller_end) = tokio::io::duplex(64 * 1024);
        let (remote_r, remote_w) = tokio::io::split(remote_end);
        let (controller_r, controller_w) = tokio::io::split(controller_end);

        let remote_cancel = CancellationToken::new();
        let remote = tokio::spawn(remote::serve(
            bridge,
            opts.heartbeat,
            remote_r,
            remote_w,
            remote_cancel.clone(),
        ));

        let stats = items.stats.clone();
        let server = RelayServer::new(SecretResolver::new(items, JqEngine));
        let controller_cancel = CancellationToken::new();
        let controller = tokio::spawn({
            let cancel = controller_cancel.clone();
            async move { server.run(controller_r, controller_w, cancel).await }
        });

        Ok(Self {
            socket_path,
            stats,
            remote_cancel,
            controller_cancel,
            remote: Some(remote),
            controller: Some(controller),
            _socket_dir: socket_dir,
        })
    }

    /// Stop the controller side, as if the controller were killed.
    pub fn stop_controller(&self) {
        self.controller_cancel.cancel();
    }

    /// Wait for the remote side to finish on its own.
    pub async fn join_remote(&mut self) -> Result<()> {
        self.remote.take().context("remote side already joined")?.await?
    }

    /// Wait for the controller side to finish on its own.
    pub async fn join_controller(&mut self) -> Result<()> {
        self.controller
            .take()
            .context("controller side already joined")?
            .await??;
        Ok(())
    }
}

impl Drop for TestTunnel {
    fn drop(&mut self) {
        self.remote_cancel.cancel();
        self.controller_cancel.cancel();
    }
}
