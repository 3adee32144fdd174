//! Framed codec for evaluator communication.
//!
//! Frames are concatenated MessagePack values with no length prefix, so the
//! decoder parses speculatively: a value cut short by the end of the buffer
//! leaves every byte in place until the next read completes it.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, in-memory duplex).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Codec that frames and serializes messages as MessagePack.
///
/// Structs are written as maps keyed by field name.
pub struct MsgPackCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> Default for MsgPackCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MsgPackCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

/// True when decoding failed only because the buffer ran out.
fn is_incomplete(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;
    match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

impl<T: DeserializeOwned> Decoder for MsgPackCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = io::Cursor::new(&src[..]);
        let result = {
            let mut de = rmp_serde::Deserializer::new(&mut cursor);
            T::deserialize(&mut de)
        };

        match result {
            Ok(item) => {
                let consumed = cursor.position() as usize;
                tracing::trace!(frame_size_bytes = consumed, "Decoded frame");
                src.advance(consumed);
                Ok(Some(item))
            }
            Err(e) if is_incomplete(&e) => {
                src.reserve(1024);
                Ok(None)
            }
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

impl<T: Serialize> Encoder<T> for MsgPackCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = rmp_serde::to_vec_named(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_size_bytes = bytes.len(), "Encoding frame");
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{
        CloseEvaluator, EvaluateResponse, IncomingMessage, Log, OutgoingMessage,
    };
    use crate::value::RawValue;

    fn log_frame(message: &str) -> IncomingMessage {
        IncomingMessage::Log(Log {
            evaluator_id: 1,
            level: 0,
            message: message.to_string(),
            frame_uri: "repl:text".to_string(),
        })
    }

    fn encoded(msg: &IncomingMessage) -> Vec<u8> {
        rmp_serde::to_vec_named(msg).unwrap()
    }

    #[test]
    fn partial_frame_is_retained_until_complete() {
        let mut codec = MsgPackCodec::<IncomingMessage>::new();
        let msg = log_frame("hello");
        let bytes = encoded(&msg);
        let (head, tail) = bytes.split_at(bytes.len() / 2);

        let mut buf = BytesMut::from(head);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), head.len());

        buf.extend_from_slice(tail);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = MsgPackCodec::<IncomingMessage>::new();
        let first = log_frame("one");
        let second = IncomingMessage::EvaluateResponse(EvaluateResponse {
            request_id: 5,
            evaluator_id: 1,
            result: None,
            error: Some("boom".to_string()),
        });

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded(&first));
        buf.extend_from_slice(&encoded(&second));
        // A third frame, cut short.
        buf.extend_from_slice(&encoded(&log_frame("three"))[..4]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn unknown_code_is_invalid_data() {
        let mut codec = MsgPackCodec::<IncomingMessage>::new();
        let mut buf = BytesMut::from(&rmp_serde::to_vec(&(0x7fu8, ())).unwrap()[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn raw_frames_resync_after_unknown_code() {
        let mut codec = MsgPackCodec::<RawValue>::new();
        let mut buf = BytesMut::from(&rmp_serde::to_vec(&(0x7fu8, ())).unwrap()[..]);
        buf.extend_from_slice(&encoded(&log_frame("after")));

        let unknown = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(unknown, RawValue::Array(vec![RawValue::Int(0x7f), RawValue::Nil]));
        let next = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(IncomingMessage::from_raw(&next).unwrap(), log_frame("after"));
        assert!(buf.is_empty());
    }

    #[test]
    fn encoder_output_decodes_as_same_frame() {
        let mut encoder = MsgPackCodec::<OutgoingMessage>::new();
        let mut decoder = MsgPackCodec::<OutgoingMessage>::new();
        let mut buf = BytesMut::new();

        let msg = OutgoingMessage::CloseEvaluator(CloseEvaluator { evaluator_id: 42 });
        encoder.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(msg));
    }
}
