use crate::error::RelayError;
use pipesecret::codec::MessageChannel;
use pipesecret::protocol::{Message, Response, RpcError};
use serde_json::Value;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Answers requests arriving over the duplex channel.
pub trait Handler: Send + Sync {
    fn handle(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send;
}

/// Controller end of the duplex channel. Reads one request at a time,
/// dispatches it to the handler and writes back its response.
pub struct RelayServer<H> {
    handler: H,
}

impl<H: Handler> RelayServer<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Serve until the peer closes its side (a clean stop), `cancel` fires,
    /// or the channel fails. The write side is closed on every exit path.
    pub async fn run<R, W>(
        &self,
        reader: R,
        writer: W,
        cancel: CancellationToken,
    ) -> Result<(), RelayError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut channel = MessageChannel::new(reader, writer);
        let result = self.serve(&mut channel, &cancel).await;
        if let Err(e) = channel.close().await {
            debug!(err = %e, "failed to close relay channel");
        }
        result
    }

    async fn serve<R, W>(
        &self,
        channel: &mut MessageChannel<R, W>,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("relay server cancelled");
                    return Ok(());
                }
                next = channel.recv() => next,
            };

            let request = match next {
                None => {
                    info!("remote side closed the channel");
                    return Ok(());
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Response(_))) => {
                    return Err(RelayError::UnexpectedMessage {
                        expected: "request",
                        got: "response",
                    });
                }
                Some(Ok(Message::Request(req))) => req,
            };

            let id = request.id;
            let method = request.method;
            debug!(?id, %method, "handling request");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                outcome = self.handler.handle(&method, request.params) => outcome,
            };
            if let Err(e) = &outcome {
                debug!(?id, %method, err = %e, "request failed");
            }

            // Notifications are never answered.
            let Some(id) = id else { continue };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = channel.send(Response { id: Some(id), outcome }) => sent?,
            }
        }
    }
}
