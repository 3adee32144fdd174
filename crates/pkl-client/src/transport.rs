//! Duplex frame transport over the evaluator's stdio.
//!
//! The read half is owned by the dispatcher loop; the write half is shared by
//! every caller and serialized by one async mutex so frames never interleave.
//!
//! Frames are read untyped first. A frame that is valid MessagePack but not a
//! known message is skipped; only bytes that are not MessagePack at all end
//! the stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::MsgPackCodec;
use crate::bridge::protocol::{IncomingMessage, OutgoingMessage};
use crate::value::RawValue;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

pub struct Transport {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Transport {
    pub fn new(
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        let reader: BoxedReader = Box::pin(reader);
        let writer: BoxedWriter = Box::pin(writer);
        Self {
            reader: FrameReader {
                inner: FramedRead::new(reader, MsgPackCodec::new()),
                finished: false,
            },
            writer: FrameWriter {
                inner: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                    writer,
                    MsgPackCodec::new(),
                ))),
            },
        }
    }

    pub fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

pub struct FrameReader {
    inner: FramedRead<BoxedReader, MsgPackCodec<RawValue>>,
    finished: bool,
}

impl FrameReader {
    /// Next complete frame. `Ok(None)` at end of stream; once the stream has
    /// ended or failed, every later call returns `Ok(None)`.
    ///
    /// Frames that do not type as an [`IncomingMessage`] are logged and
    /// skipped.
    pub async fn read_frame(&mut self) -> io::Result<Option<IncomingMessage>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            match self.inner.next().await {
                Some(Ok(raw)) => match IncomingMessage::from_raw(&raw) {
                    Ok(msg) => {
                        tracing::trace!(code = %msg.code(), "Received frame");
                        return Ok(Some(msg));
                    }
                    Err(e) => {
                        tracing::warn!(
                            code = ?frame_code(&raw),
                            error = %e,
                            "Dropping undecodable frame"
                        );
                    }
                },
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(e);
                }
                None => {
                    self.finished = true;
                    return Ok(None);
                }
            }
        }
    }
}

/// The leading code of a `[code, payload]` frame, if it has one.
fn frame_code(raw: &RawValue) -> Option<i64> {
    match raw {
        RawValue::Array(items) => items.first().and_then(RawValue::as_i64),
        _ => None,
    }
}

#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<tokio::sync::Mutex<FramedWrite<BoxedWriter, MsgPackCodec<OutgoingMessage>>>>,
}

impl FrameWriter {
    /// Encode and flush one frame while holding the writer lock.
    pub async fn write_frame(&self, msg: OutgoingMessage) -> io::Result<()> {
        let code = msg.code();
        let mut writer = self.inner.lock().await;
        writer.send(msg).await?;
        tracing::trace!(%code, "Sent frame");
        Ok(())
    }

    /// Close the write half; the evaluator sees end of input.
    pub async fn shutdown(&self) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.close().await
    }
}
