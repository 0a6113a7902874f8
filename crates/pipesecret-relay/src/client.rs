use crate::error::RelayError;
use crate::queue::{CallError, CallReceiver, QueuedCall};
use pipesecret::codec::MessageChannel;
use pipesecret::protocol::{Id, Message, Request, Response};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Remote end of the duplex channel. Forwards queued calls one at a time
/// and keeps the channel alive with heartbeats while the queue is idle.
pub struct RelayClient {
    calls: CallReceiver,
    heartbeat_interval: Duration,
}

impl RelayClient {
    pub fn new(calls: CallReceiver, heartbeat_interval: Duration) -> Self {
        Self {
            calls,
            heartbeat_interval,
        }
    }

    /// Relay until cancelled, the queue closes, or the channel fails.
    ///
    /// Callers still waiting when the relay stops get [`CallError::Cancelled`]
    /// after a cancel and [`CallError::RelayClosed`] after a channel failure.
    /// The write side is closed on the way out unless a message was cut off
    /// mid-write, in which case it is dropped without flushing so the peer
    /// never sees the remainder of that message.
    pub async fn run<R, W>(
        mut self,
        reader: R,
        writer: W,
        cancel: CancellationToken,
    ) -> Result<(), RelayError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut channel = MessageChannel::new(reader, writer);
        let result = self.drive(&mut channel, &cancel).await;
        let reason = match &result {
            Ok(()) => {
                debug!("relay client stopping");
                CallError::Cancelled
            }
            Err(e) => {
                warn!(err = %e, "relay client failed");
                CallError::RelayClosed
            }
        };
        self.calls.close(reason);

        if channel.has_unflushed() {
            debug!("dropping relay channel with a partially written message");
        } else if let Err(e) = channel.close().await {
            debug!(err = %e, "failed to close relay channel");
        }
        result
    }

    async fn drive<R, W>(
        &mut self,
        channel: &mut MessageChannel<R, W>,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                call = self.calls.recv() => match call {
                    Some(call) => relay_call(channel, cancel, call).await?,
                    None => {
                        debug!("call queue closed");
                        return Ok(());
                    }
                },
                _ = tokio::time::sleep(self.heartbeat_interval) => heartbeat(channel, cancel).await?,
            }
        }
    }
}

async fn relay_call<R, W>(
    channel: &mut MessageChannel<R, W>,
    cancel: &CancellationToken,
    call: QueuedCall,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if call.is_abandoned() {
        debug!(caller_id = ?call.request.id, "skipping call abandoned by its caller");
        return Ok(());
    }
    let (request, reply) = call.into_parts();

    // Callers pick their own ids, so two of them may collide. Each call gets
    // a fresh id on the wire and the caller's id is restored on the way back.
    let caller_id = request.id;
    let relay_id = Id::random();
    debug!(%relay_id, ?caller_id, method = %request.method, "relaying call");

    let outbound = Request::call(relay_id.clone(), request.method, request.params);
    let Some(mut response) = exchange(channel, cancel, outbound).await? else {
        debug!(%relay_id, "call cancelled while in flight");
        let _ = reply.send(Response::error(caller_id, CallError::Cancelled.to_rpc_error()));
        return Ok(());
    };
    response.id = caller_id;
    if reply.send(response).is_err() {
        debug!(%relay_id, "caller gave up before the response arrived");
    }
    Ok(())
}

async fn heartbeat<R, W>(
    channel: &mut MessageChannel<R, W>,
    cancel: &CancellationToken,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = Request::heartbeat();
    debug!(id = ?request.id, "sending heartbeat");
    if let Some(Response {
        outcome: Err(e), ..
    }) = exchange(channel, cancel, request).await?
    {
        warn!(err = %e, "heartbeat answered with an error");
    }
    Ok(())
}

/// Send `request` and wait for the matching response. `None` means the
/// exchange was cut short by cancellation.
async fn exchange<R, W>(
    channel: &mut MessageChannel<R, W>,
    cancel: &CancellationToken,
    request: Request,
) -> Result<Option<Response>, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let expected = request.id.clone();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        sent = channel.send(request) => sent?,
    }

    let next = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        next = channel.recv() => next,
    };

    match next {
        None => Err(RelayError::PeerClosed),
        Some(Err(e)) => Err(e.into()),
        Some(Ok(Message::Request(_))) => Err(RelayError::UnexpectedMessage {
            expected: "response",
            got: "request",
        }),
        Some(Ok(Message::Response(resp))) if resp.id == expected => Ok(Some(resp)),
        Some(Ok(Message::Response(resp))) => Err(RelayError::MismatchedId {
            expected: display_id(&expected),
            got: display_id(&resp.id),
        }),
    }
}

fn display_id(id: &Option<Id>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "null".to_string(),
    }
}
