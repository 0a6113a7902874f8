use pipesecret::codec::CodecError;

/// Failure of a relay endpoint. Every variant means the duplex channel can
/// no longer be trusted; there is no reconnect.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(#[from] CodecError),
    #[error("peer closed the channel while a response was pending")]
    PeerClosed,
    #[error("expected a {expected}, got a {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
    #[error("response id {got} does not match request id {expected}")]
    MismatchedId { expected: String, got: String },
}
