use super::init_tracing;
use super::tunnel::{TunnelOptions, bind_bridge};
use anyhow::{Context, Result};
use pipesecret::codec::MessageChannel;
use pipesecret::protocol::{HEARTBEAT, HEARTBEAT_ACK, Message, Request, Response};
use pipesecret_relay::remote;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type PeerChannel = MessageChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// The remote side only, with the test playing the controller line by line.
pub struct ScriptedPeer {
    pub socket_path: PathBuf,
    pub channel: PeerChannel,
    cancel: CancellationToken,
    remote: Option<JoinHandle<Result<()>>>,
    _socket_dir: TempDir,
}

impl ScriptedPeer {
    pub async fn spawn(opts: TunnelOptions) -> Result<Self> {
        init_tracing();
        let (bridge, socket_path, socket_dir) = bind_bridge(&opts)?;

        let (remote_end, peer_end) = tokio::io::duplex(64 * 1024);
        let (remote_r, remote_w) = tokio::io::split(remote_end);
        let (peer_r, peer_w) = tokio::io::split(peer_end);

        let cancel = CancellationToken::new();
        let remote = tokio::spawn(remote::serve(
            bridge,
            opts.heartbeat,
            remote_r,
            remote_w,
            cancel.clone(),
        ));

        Ok(Self {
            socket_path,
            channel: MessageChannel::new(peer_r, peer_w),
            cancel,
            remote: Some(remote),
            _socket_dir: socket_dir,
        })
    }

    /// Next relayed call, answering any heartbeats that come first.
    pub async fn next_call(&mut self) -> Request {
        loop {
            match self.channel.recv().await {
                Some(Ok(Message::Request(req))) if req.method == HEARTBEAT => {
                    self.ack(req).await;
                }
                Some(Ok(Message::Request(req))) => return req,
                other => panic!("expected a request, got {other:?}"),
            }
        }
    }

    /// Assert that nothing but heartbeats arrives for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.channel.recv()).await {
                Err(_) => return,
                Ok(Some(Ok(Message::Request(req)))) if req.method == HEARTBEAT => {
                    self.ack(req).await;
                }
                Ok(other) => panic!("expected silence, got {other:?}"),
            }
        }
    }

    pub async fn reply(&mut self, request: &Request, result: Value) {
        self.channel
            .send(Response::ok(request.id.clone(), result))
            .await
            .unwrap();
    }

    async fn ack(&mut self, heartbeat: Request) {
        self.channel
            .send(Response::ok(heartbeat.id, Value::from(HEARTBEAT_ACK)))
            .await
            .unwrap();
    }

    /// Stop the whole remote side, as an interrupt of `remote-serve` would.
    pub fn cancel_remote(&self) {
        self.cancel.cancel();
    }

    /// Wait for the remote side to finish on its own.
    pub async fn join_remote(&mut self) -> Result<()> {
        self.remote.take().context("remote side already joined")?.await?
    }
}

impl Drop for ScriptedPeer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
