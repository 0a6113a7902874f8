//! Self-delimiting framing for the duplex channel.
//!
//! Each message is one compact JSON value followed by `\n`. A reader that
//! reaches end of input with nothing buffered sees the stream end (`None`);
//! a partial trailing frame or an unparseable line is a [`CodecError`].

use crate::protocol::{MAX_LINE_BYTES, Message};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame exceeds {} bytes", MAX_LINE_BYTES)]
    FrameTooLong,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl From<LinesCodecError> for CodecError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => CodecError::FrameTooLong,
            LinesCodecError::Io(e) => CodecError::Io(e),
        }
    }
}

/// [`Message`] codec layered over [`LinesCodec`].
#[derive(Debug)]
pub struct MessageCodec {
    lines: LinesCodec,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_line(line: &str) -> Result<Option<Message>, CodecError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(Message::from_line(line)?))
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        while let Some(line) = self.lines.decode(src)? {
            if let Some(msg) = parse_line(&line)? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        // LinesCodec hands back an unterminated tail as a final line, so a
        // truncated frame surfaces as a JSON error here.
        while let Some(line) = self.lines.decode_eof(src)? {
            if let Some(msg) = parse_line(&line)? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let line = item.to_line()?;
        self.lines.encode(line, dst)?;
        Ok(())
    }
}

/// One end of a duplex byte channel, framed as [`Message`]s.
pub struct MessageChannel<R, W> {
    reader: FramedRead<R, MessageCodec>,
    writer: FramedWrite<W, MessageCodec>,
}

impl<R, W> MessageChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, MessageCodec::new()),
            writer: FramedWrite::new(writer, MessageCodec::new()),
        }
    }

    /// Write and flush one message.
    pub async fn send(&mut self, msg: impl Into<Message>) -> Result<(), CodecError> {
        self.writer.send(msg.into()).await
    }

    /// Next message, or `None` once the peer has closed its side cleanly.
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Result<Message, CodecError>> {
        self.reader.next().await
    }

    /// Whether an interrupted [`send`](Self::send) left bytes behind.
    pub fn has_unflushed(&self) -> bool {
        !self.writer.write_buffer().is_empty()
    }

    /// Flush and shut down the write side so the peer observes end of stream.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        self.writer.close().await
    }
}
