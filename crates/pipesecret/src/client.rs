use crate::codec::{CodecError, MessageChannel};
use crate::protocol::{
    GET_QUERY_ITEM, GetQueryItemParams, Id, Message, Request, RpcError, SHUTDOWN,
};
use crate::secret::{SecretFields, ShapeError, parse_secret_fields};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {}", path.display())]
    ConnectTimeout { path: PathBuf },
    #[error("bridge closed the connection")]
    Disconnected,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("bridge returned an error: {0}")]
    Rpc(#[from] RpcError),
    #[error("unexpected message from bridge: {0}")]
    Unexpected(String),
    #[error("getQueryItem result is not a string")]
    NotAString,
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

impl ClientError {
    /// True when the failure is about reaching the bridge at all rather
    /// than about what it answered.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. } | ClientError::ConnectTimeout { .. } | ClientError::Disconnected
        )
    }
}

fn from_codec(e: CodecError) -> ClientError {
    match e {
        CodecError::Io(ref io)
            if matches!(
                io.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ) =>
        {
            ClientError::Disconnected
        }
        other => ClientError::Codec(other),
    }
}

/// Client for the local socket bridge.
pub struct BridgeClient {
    channel: MessageChannel<OwnedReadHalf, OwnedWriteHalf>,
    next_id: i64,
}

impl BridgeClient {
    /// Connect to the bridge, giving up after `timeout`.
    pub async fn connect(socket_path: &Path, timeout: Duration) -> Result<Self, ClientError> {
        let stream = match tokio::time::timeout(timeout, UnixStream::connect(socket_path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    path: socket_path.to_path_buf(),
                    source,
                });
            }
            Err(_) => {
                return Err(ClientError::ConnectTimeout {
                    path: socket_path.to_path_buf(),
                });
            }
        };
        let (r, w) = stream.into_split();
        Ok(Self {
            channel: MessageChannel::new(r, w),
            next_id: 1,
        })
    }

    /// Issue one call and wait for its response.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = Id::Number(self.next_id);
        self.next_id += 1;

        self.channel
            .send(Request::call(id.clone(), method, params))
            .await
            .map_err(from_codec)?;

        loop {
            match self.channel.recv().await {
                None => return Err(ClientError::Disconnected),
                Some(Err(e)) => return Err(from_codec(e)),
                Some(Ok(Message::Response(resp))) if resp.id.as_ref() == Some(&id) => {
                    return resp.outcome.map_err(ClientError::from);
                }
                // Errors the bridge could not attribute to a call.
                Some(Ok(Message::Response(resp))) if resp.id.is_none() => {
                    return resp.outcome.map_err(ClientError::from);
                }
                Some(Ok(Message::Response(resp))) => {
                    tracing::debug!(id = ?resp.id, "skipping response to another call");
                }
                Some(Ok(Message::Request(req))) => {
                    return Err(ClientError::Unexpected(format!("request {:?}", req.method)));
                }
            }
        }
    }

    /// Run `query` against `item` and return the raw query output.
    pub async fn get_query_item_raw(
        &mut self,
        item: &str,
        query: &str,
    ) -> Result<String, ClientError> {
        let params = serde_json::to_value(GetQueryItemParams {
            item: item.to_string(),
            query: query.to_string(),
        })
        .map_err(CodecError::from)?;

        match self.call(GET_QUERY_ITEM, params).await? {
            Value::String(raw) => Ok(raw),
            _ => Err(ClientError::NotAString),
        }
    }

    /// Run `query` against `item`; the output must be a flat string object.
    pub async fn get_query_item(
        &mut self,
        item: &str,
        query: &str,
    ) -> Result<SecretFields, ClientError> {
        let raw = self.get_query_item_raw(item, query).await?;
        Ok(parse_secret_fields(&raw)?)
    }

    /// Ask the bridge to stop after its grace period.
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        self.call(SHUTDOWN, Value::Null).await?;
        Ok(())
    }
}
