pub mod items;
pub mod peer;
pub mod tunnel;

use pipesecret::client::{BridgeClient, ClientError};
use pipesecret::protocol::ErrorCode;
use std::path::Path;
use std::time::Duration;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("pipesecret=debug,pipesecret_relay=debug,pipesecret_item=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub async fn connect(socket_path: &Path) -> BridgeClient {
    BridgeClient::connect(socket_path, CONNECT_TIMEOUT)
        .await
        .unwrap()
}

/// The RPC error code carried by `err`, or panic.
pub fn rpc_code(err: &ClientError) -> ErrorCode {
    match err {
        ClientError::Rpc(e) => e.code,
        other => panic!("expected an RPC error, got {other}"),
    }
}

/// Write `lines` to the bridge, half-close, and collect every response line
/// until the bridge closes the connection.
pub async fn raw_session(socket_path: &Path, lines: &[&str]) -> Vec<serde_json::Value> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let stream = tokio::net::UnixStream::connect(socket_path).await.unwrap();
    let (r, mut w) = stream.into_split();
    for line in lines {
        w.write_all(line.as_bytes()).await.unwrap();
        w.write_all(b"\n").await.unwrap();
    }
    w.shutdown().await.unwrap();

    let mut responses = Vec::new();
    let mut reader = BufReader::new(r).lines();
    while let Some(line) = reader.next_line().await.unwrap() {
        responses.push(serde_json::from_str(&line).unwrap());
    }
    responses
}
