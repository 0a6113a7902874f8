//! Local Unix socket that lets processes on the remote host issue calls.
//!
//! Each accepted connection speaks the same newline-delimited JSON-RPC as
//! the duplex channel. `getQueryItem` calls are pushed through the call
//! queue, `shutdown` stops the bridge after a grace period, and anything
//! else is answered locally with an error.

use crate::queue::{CallError, CallSender};
use futures_util::{SinkExt, StreamExt};
use pipesecret::codec::CodecError;
use pipesecret::config::{DEFAULT_CALL_TIMEOUT, DEFAULT_SHUTDOWN_GRACE};
use pipesecret::protocol::{
    ErrorCode, GET_QUERY_ITEM, GetQueryItemParams, Id, MAX_LINE_BYTES, Message, Request,
    Response, RpcError, SHUTDOWN,
};
use serde_json::Value;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinError, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub socket_path: PathBuf,
    /// How long the listener stays open after a `shutdown` call.
    pub shutdown_grace: Duration,
    /// Upper bound on one queued call, measured from when it is accepted.
    pub call_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to create socket directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to remove stale socket {}: {source}", path.display())]
    RemoveStale { path: PathBuf, source: io::Error },
    #[error("failed to bind {}: {source}", path.display())]
    Bind { path: PathBuf, source: io::Error },
    #[error("failed to accept a connection: {0}")]
    Accept(#[source] io::Error),
}

/// A bound, not yet serving, bridge.
pub struct Bridge {
    listener: UnixListener,
    config: BridgeConfig,
    shutdown: CancellationToken,
}

impl Bridge {
    /// Bind the socket, replacing a stale one left by an earlier run. Must
    /// be called from within a tokio runtime.
    pub fn bind(config: BridgeConfig) -> Result<Self, BridgeError> {
        let path = config.socket_path.as_path();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| BridgeError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        remove_stale_socket(path)?;

        let listener = UnixListener::bind(path).map_err(|source| BridgeError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            warn!(path = %path.display(), err = %e, "failed to restrict socket permissions");
        }

        info!(path = %path.display(), "local socket bridge listening");
        Ok(Self {
            listener,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Token fired by a `shutdown` call. Firing it directly has the same
    /// effect.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until `cancel` fires, a requested shutdown's grace
    /// period elapses, or accepting fails. The socket file is removed and
    /// every connection is closed before returning.
    pub async fn run(self, calls: CallSender, cancel: CancellationToken) -> Result<(), BridgeError> {
        let Bridge {
            listener,
            config,
            shutdown,
        } = self;

        let connection = Connection {
            calls,
            shutdown: shutdown.clone(),
            call_timeout: config.call_timeout,
        };
        let connections_cancel = cancel.child_token();
        let mut connections = JoinSet::new();

        let grace = config.shutdown_grace;
        let grace_elapsed = async move {
            shutdown.cancelled().await;
            info!(?grace, "shutdown requested, closing bridge after grace period");
            tokio::time::sleep(grace).await;
        };
        tokio::pin!(grace_elapsed);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("bridge cancelled");
                    break Ok(());
                }
                _ = &mut grace_elapsed => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!("local caller connected");
                        connections.spawn(connection.clone().serve(stream, connections_cancel.clone()));
                    }
                    Err(e) => break Err(BridgeError::Accept(e)),
                },
                Some(done) = connections.join_next() => log_connection_end(done),
            }
        };

        drop(listener);
        match std::fs::remove_file(&config.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %config.socket_path.display(), err = %e, "failed to remove socket"),
        }

        connections_cancel.cancel();
        while let Some(done) = connections.join_next().await {
            log_connection_end(done);
        }
        info!("local socket bridge stopped");
        result
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), BridgeError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(BridgeError::RemoveStale {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn log_connection_end(done: Result<Result<(), CodecError>, JoinError>) {
    match done {
        Ok(Ok(())) => debug!("local caller disconnected"),
        Ok(Err(e)) => debug!(err = %e, "local connection ended with an error"),
        Err(e) => warn!(err = %e, "local connection task failed"),
    }
}

type LineWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

#[derive(Clone)]
struct Connection {
    calls: CallSender,
    shutdown: CancellationToken,
    call_timeout: Duration,
}

impl Connection {
    async fn serve(self, stream: UnixStream, cancel: CancellationToken) -> Result<(), CodecError> {
        let (r, w) = stream.into_split();
        let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let mut in_flight: JoinSet<Response> = JoinSet::new();

        let read_result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(done) = in_flight.join_next() => {
                    if let Some(resp) = finished(done) {
                        write_response(&mut writer, resp).await?;
                    }
                }
                line = reader.next() => match line {
                    None => break Ok(()),
                    Some(Ok(line)) => {
                        if let Some(resp) = self.dispatch(&line, &mut in_flight, &cancel) {
                            write_response(&mut writer, resp).await?;
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let resp = Response::error(
                            None,
                            RpcError::new(
                                ErrorCode::ParseError,
                                format!("request exceeds {MAX_LINE_BYTES} bytes"),
                            ),
                        );
                        write_response(&mut writer, resp).await?;
                        break Err(CodecError::FrameTooLong);
                    }
                    Some(Err(e)) => break Err(e.into()),
                },
            }
        };

        // A half-closed caller still gets its answers. After a cancel the
        // remaining calls resolve promptly with cancellation errors.
        while let Some(done) = in_flight.join_next().await {
            if let Some(resp) = finished(done) {
                write_response(&mut writer, resp).await?;
            }
        }
        if let Err(e) = SinkExt::<String>::close(&mut writer).await {
            debug!(err = %e, "failed to close local connection");
        }
        read_result
    }

    /// Handle one line. Returns the immediate response, if any; forwarded
    /// calls answer later through `in_flight`.
    fn dispatch(
        &self,
        line: &str,
        in_flight: &mut JoinSet<Response>,
        cancel: &CancellationToken,
    ) -> Option<Response> {
        if line.trim().is_empty() {
            return None;
        }
        let request = match Message::from_line(line) {
            Ok(Message::Request(req)) => req,
            Ok(Message::Response(resp)) => {
                return Some(Response::error(
                    resp.id,
                    RpcError::new(ErrorCode::InvalidRequest, "expected a request, got a response"),
                ));
            }
            Err(e) => {
                return Some(Response::error(
                    None,
                    RpcError::new(ErrorCode::ParseError, format!("invalid request: {e}")),
                ));
            }
        };

        match request.method.as_str() {
            SHUTDOWN => {
                if self.shutdown.is_cancelled() {
                    debug!("shutdown already requested");
                } else {
                    info!("shutdown requested by local caller");
                }
                self.shutdown.cancel();
                reply(request.id, Ok(Value::String(String::new())))
            }
            GET_QUERY_ITEM => {
                let params = match serde_json::from_value::<GetQueryItemParams>(request.params) {
                    Ok(params) => params,
                    Err(e) => {
                        return reply(
                            request.id,
                            Err(RpcError::new(
                                ErrorCode::ParseError,
                                format!("invalid getQueryItem params: {e}"),
                            )),
                        );
                    }
                };
                let Some(id) = request.id else {
                    debug!(item = %params.item, "ignoring getQueryItem notification");
                    return None;
                };
                let params = match serde_json::to_value(&params) {
                    Ok(params) => params,
                    Err(e) => {
                        return reply(
                            Some(id),
                            Err(RpcError::new(ErrorCode::InternalError, e.to_string())),
                        );
                    }
                };
                in_flight.spawn(forward(
                    self.calls.clone(),
                    Request::call(id, GET_QUERY_ITEM, params),
                    self.call_timeout,
                    cancel.child_token(),
                ));
                None
            }
            other => reply(request.id, Err(RpcError::method_not_handled(other))),
        }
    }
}

/// Push one call through the queue, bounding it by `timeout`.
async fn forward(
    calls: CallSender,
    request: Request,
    timeout: Duration,
    cancel: CancellationToken,
) -> Response {
    let id = request.id.clone();
    let err = match tokio::time::timeout(timeout, calls.call(request, &cancel)).await {
        Ok(Ok(response)) => return response,
        Ok(Err(e)) => e,
        Err(_) => CallError::TimedOut(timeout),
    };
    debug!(?id, err = %err, "call did not complete");
    Response::error(id, err.to_rpc_error())
}

fn reply(id: Option<Id>, outcome: Result<Value, RpcError>) -> Option<Response> {
    // Notifications never get a response.
    id.map(|id| Response {
        id: Some(id),
        outcome,
    })
}

fn finished(done: Result<Response, JoinError>) -> Option<Response> {
    match done {
        Ok(resp) => Some(resp),
        Err(e) => {
            warn!(err = %e, "call task failed");
            None
        }
    }
}

async fn write_response(writer: &mut LineWriter, resp: Response) -> Result<(), CodecError> {
    let line = Message::from(resp).to_line()?;
    writer.send(line).await?;
    Ok(())
}
