//! IPC bridge between the client and the evaluator process.
//!
//! # Architecture
//!
//! - **protocol**: Message codes and typed frames (`OutgoingMessage`, `IncomingMessage`)
//! - **codec**: MessagePack framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
