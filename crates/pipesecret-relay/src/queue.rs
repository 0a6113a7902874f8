//! Hand-off between local callers and the relay client.
//!
//! The queue holds at most one call. Callers beyond that wait in [`CallSender::call`]
//! until the relay takes the pending one, so at most one call sits in the
//! buffer and at most one is outstanding on the wire at any time.

use pipesecret::protocol::{ErrorCode, Request, Response, RpcError};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub const QUEUE_CAPACITY: usize = 1;

/// Why a queued call produced no response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("call cancelled")]
    Cancelled,
    #[error("call timed out after {0:?}")]
    TimedOut(Duration),
    #[error("relay closed before the call completed")]
    RelayClosed,
}

impl CallError {
    pub fn to_rpc_error(&self) -> RpcError {
        let code = match self {
            CallError::Cancelled | CallError::TimedOut(_) => ErrorCode::Cancelled,
            CallError::RelayClosed => ErrorCode::Transport,
        };
        RpcError::new(code, self.to_string())
    }
}

/// A call waiting for the relay, paired with the slot its response goes to.
#[derive(Debug)]
pub struct QueuedCall {
    pub request: Request,
    reply: oneshot::Sender<Response>,
}

impl QueuedCall {
    /// The caller stopped waiting; relaying the call would be wasted work.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    pub fn into_parts(self) -> (Request, oneshot::Sender<Response>) {
        (self.request, self.reply)
    }
}

pub fn call_queue() -> (CallSender, CallReceiver) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let stopped = Arc::new(OnceLock::new());
    (
        CallSender {
            tx,
            stopped: stopped.clone(),
        },
        CallReceiver { rx, stopped },
    )
}

#[derive(Debug, Clone)]
pub struct CallSender {
    tx: mpsc::Sender<QueuedCall>,
    stopped: Arc<OnceLock<CallError>>,
}

impl CallSender {
    /// Enqueue `request` and wait for its response.
    ///
    /// Cancelling `cancel` gives up at either stage: while waiting for queue
    /// space, or while the call is queued or in flight. A response that
    /// arrives after cancellation is dropped by the relay.
    pub async fn call(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, CallError> {
        let (reply, response) = oneshot::channel();
        let queued = QueuedCall { request, reply };

        // A closed queue is checked before `cancel` at both stages: when the
        // relay stops it can have fired `cancel` too, and the reason it
        // recorded decides the error.
        tokio::select! {
            biased;
            sent = self.tx.send(queued) => sent.map_err(|_| self.stop_reason())?,
            _ = cancel.cancelled() => return Err(CallError::Cancelled),
        }

        tokio::select! {
            biased;
            response = response => response.map_err(|_| self.stop_reason()),
            _ = cancel.cancelled() => Err(CallError::Cancelled),
        }
    }

    fn stop_reason(&self) -> CallError {
        self.stopped
            .get()
            .cloned()
            .unwrap_or(CallError::RelayClosed)
    }
}

#[derive(Debug)]
pub struct CallReceiver {
    rx: mpsc::Receiver<QueuedCall>,
    stopped: Arc<OnceLock<CallError>>,
}

impl CallReceiver {
    /// Next queued call, or `None` once every sender is gone. Cancel safe.
    pub async fn recv(&mut self) -> Option<QueuedCall> {
        self.rx.recv().await
    }

    /// Stop taking calls. Calls still queued, and callers still waiting for
    /// room, fail with `reason`.
    pub fn close(self, reason: CallError) {
        let _ = self.stopped.set(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipesecret::protocol::Id;
    use serde_json::Value;

    fn request(id: i64) -> Request {
        Request::call(id, "getQueryItem", Value::Null)
    }

    #[tokio::test]
    async fn response_reaches_the_caller() {
        let (tx, mut rx) = call_queue();
        let cancel = CancellationToken::new();

        let caller = tokio::spawn(async move { tx.call(request(7), &cancel).await });
        let (req, reply) = rx.recv().await.unwrap().into_parts();
        assert_eq!(req.id, Some(Id::Number(7)));
        reply.send(Response::ok(req.id, Value::from("ok"))).unwrap();

        let resp = caller.await.unwrap().unwrap();
        assert_eq!(resp.outcome, Ok(Value::from("ok")));
    }

    #[tokio::test]
    async fn cancelling_a_caller_blocked_on_capacity_leaves_the_queued_one_alone() {
        let (tx, mut rx) = call_queue();

        let first_cancel = CancellationToken::new();
        let first = {
            let tx = tx.clone();
            let cancel = first_cancel.clone();
            tokio::spawn(async move { tx.call(request(1), &cancel).await })
        };
        // Let the first call take the only slot.
        tokio::task::yield_now().await;
        while tx.tx.capacity() > 0 {
            tokio::task::yield_now().await;
        }

        let second_cancel = CancellationToken::new();
        let second = {
            let tx = tx.clone();
            let cancel = second_cancel.clone();
            tokio::spawn(async move { tx.call(request(2), &cancel).await })
        };
        second_cancel.cancel();
        assert_eq!(second.await.unwrap().unwrap_err(), CallError::Cancelled);

        let queued = rx.recv().await.unwrap();
        assert!(!queued.is_abandoned());
        let (req, reply) = queued.into_parts();
        assert_eq!(req.id, Some(Id::Number(1)));
        reply.send(Response::ok(req.id, Value::Null)).unwrap();
        assert!(first.await.unwrap().is_ok());
        assert!(!first_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_call_is_marked_abandoned() {
        let (tx, mut rx) = call_queue();
        let cancel = CancellationToken::new();

        let caller = {
            let cancel = cancel.clone();
            tokio::spawn(async move { tx.call(request(3), &cancel).await })
        };
        let queued = rx.recv().await.unwrap();
        cancel.cancel();
        assert_eq!(caller.await.unwrap().unwrap_err(), CallError::Cancelled);
        assert!(queued.is_abandoned());
    }

    #[tokio::test]
    async fn dropped_relay_closes_pending_calls() {
        let (tx, rx) = call_queue();
        drop(rx);
        let err = tx
            .call(request(4), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, CallError::RelayClosed);
        assert_eq!(err.to_rpc_error().code, ErrorCode::Transport);
    }

    #[tokio::test]
    async fn closing_the_queue_reports_its_reason_to_every_waiting_caller() {
        let (tx, mut rx) = call_queue();
        let spawn_call = |id| {
            let tx = tx.clone();
            tokio::spawn(async move { tx.call(request(id), &CancellationToken::new()).await })
        };

        let taken = spawn_call(1);
        let (_req, reply) = rx.recv().await.unwrap().into_parts();
        let queued = spawn_call(2);
        while tx.tx.capacity() > 0 {
            tokio::task::yield_now().await;
        }
        let waiting = spawn_call(3);
        tokio::task::yield_now().await;

        rx.close(CallError::Cancelled);
        drop(reply);

        for caller in [taken, queued, waiting] {
            assert_eq!(caller.await.unwrap().unwrap_err(), CallError::Cancelled);
        }
        let err = tx
            .call(request(4), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Cancelled);
    }
}
