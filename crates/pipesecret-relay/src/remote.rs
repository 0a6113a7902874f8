use crate::bridge::{Bridge, BridgeConfig};
use crate::client::RelayClient;
use crate::queue::call_queue;
use anyhow::Context;
use pipesecret::error::join_results;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// The remote half of pipesecret: a local socket bridge feeding a relay
/// client that talks to the controller over the duplex channel.
pub struct RemoteServer {
    pub bridge: BridgeConfig,
    pub heartbeat_interval: Duration,
}

impl RemoteServer {
    pub fn new(bridge: BridgeConfig, heartbeat_interval: Duration) -> Self {
        Self {
            bridge,
            heartbeat_interval,
        }
    }

    /// Bind the bridge, then serve until either side stops. Failing to bind
    /// aborts before anything is written to the channel.
    pub async fn run<R, W>(self, reader: R, writer: W, cancel: CancellationToken) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let bridge = Bridge::bind(self.bridge).context("failed to start local socket bridge")?;
        serve(bridge, self.heartbeat_interval, reader, writer, cancel).await
    }
}

/// Run an already bound bridge and the relay client side by side.
///
/// Whichever finishes first cancels the other, so a `shutdown` call or a
/// broken channel stops both. Errors from the two are joined.
pub async fn serve<R, W>(
    bridge: Bridge,
    heartbeat_interval: Duration,
    reader: R,
    writer: W,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cancel = cancel.child_token();
    let (calls, queue) = call_queue();
    let relay = RelayClient::new(queue, heartbeat_interval);

    let bridge_side = async {
        let result = bridge.run(calls, cancel.clone()).await;
        cancel.cancel();
        result.context("local socket bridge failed")
    };
    let relay_side = async {
        let result = relay.run(reader, writer, cancel.clone()).await;
        cancel.cancel();
        result.context("relay client failed")
    };

    let (bridge_result, relay_result) = tokio::join!(bridge_side, relay_side);
    join_results([bridge_result, relay_result])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipesecret::client::BridgeClient;
    use pipesecret::codec::MessageChannel;
    use pipesecret::protocol::{HEARTBEAT, HEARTBEAT_ACK, Message, Response};
    use serde_json::Value;

    #[tokio::test]
    async fn bind_failure_aborts_before_touching_the_channel() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let server = RemoteServer::new(
            BridgeConfig::new(blocker.join("bridge.sock")),
            Duration::from_secs(5),
        );

        let (ours, theirs) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(ours);
        let err = server
            .run(r, w, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to start local socket bridge"));

        let (peer_r, peer_w) = tokio::io::split(theirs);
        let mut peer = MessageChannel::new(peer_r, peer_w);
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_call_stops_the_relay_too() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig::new(dir.path().join("bridge.sock"));
        config.shutdown_grace = Duration::from_millis(20);
        let bridge = Bridge::bind(config).unwrap();
        let path = bridge.socket_path().to_path_buf();

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(ours);
        let (peer_r, peer_w) = tokio::io::split(theirs);
        let mut peer = MessageChannel::new(peer_r, peer_w);
        let running = tokio::spawn(serve(
            bridge,
            Duration::from_millis(10),
            r,
            w,
            CancellationToken::new(),
        ));

        // Keep answering heartbeats until the relay closes the channel.
        let answering = tokio::spawn(async move {
            while let Some(Ok(Message::Request(req))) = peer.recv().await {
                assert_eq!(req.method, HEARTBEAT);
                if peer
                    .send(Response::ok(req.id, Value::from(HEARTBEAT_ACK)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let mut client = BridgeClient::connect(&path, Duration::from_secs(1))
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        running.await.unwrap().unwrap();
        answering.await.unwrap();
    }
}
