//! In-memory evaluator process for tests.

use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::MsgPackCodec;
use crate::bridge::protocol::{
    CreateEvaluator, CreateEvaluatorResponse, Evaluate, EvaluateResponse, IncomingMessage,
    OutgoingMessage,
};
use crate::manager::{
    EvaluatorManager, EvaluatorSpawner, ManagerConfig, SpawnError, SpawnedEvaluator,
};
use crate::value::{self, Value};

/// Hands out one pre-built duplex connection, then refuses.
pub(crate) struct DuplexSpawner {
    connection: Mutex<Option<SpawnedEvaluator>>,
}

impl EvaluatorSpawner for DuplexSpawner {
    fn spawn(&self) -> Result<SpawnedEvaluator, SpawnError> {
        self.connection
            .lock()
            .map_err(|_| SpawnError::Other("spawner poisoned".to_string()))?
            .take()
            .ok_or_else(|| SpawnError::Other("already spawned".to_string()))
    }
}

/// Evaluator side of the connection, driven step by step by the test.
pub(crate) struct FakePkl {
    frames: FramedRead<ReadHalf<DuplexStream>, MsgPackCodec<OutgoingMessage>>,
    sink: FramedWrite<WriteHalf<DuplexStream>, MsgPackCodec<IncomingMessage>>,
}

impl FakePkl {
    pub(crate) async fn recv(&mut self) -> OutgoingMessage {
        match self.frames.next().await {
            Some(Ok(msg)) => msg,
            other => panic!("expected a frame from the client, got {other:?}"),
        }
    }

    /// Next frame, or `None` once the client closed its output.
    pub(crate) async fn try_recv(&mut self) -> Option<OutgoingMessage> {
        self.frames.next().await.map(|frame| frame.unwrap())
    }

    pub(crate) async fn send(&mut self, msg: IncomingMessage) {
        self.sink.send(msg).await.unwrap();
    }

    /// Write bytes as-is, bypassing the typed encoder.
    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        let io = self.sink.get_mut();
        io.write_all(bytes).await.unwrap();
        io.flush().await.unwrap();
    }

    pub(crate) async fn expect_create(&mut self) -> CreateEvaluator {
        match self.recv().await {
            OutgoingMessage::CreateEvaluator(create) => create,
            other => panic!("expected CreateEvaluator, got {other:?}"),
        }
    }

    pub(crate) async fn expect_evaluate(&mut self) -> Evaluate {
        match self.recv().await {
            OutgoingMessage::Evaluate(evaluate) => evaluate,
            other => panic!("expected Evaluate, got {other:?}"),
        }
    }

    /// Answer the next CreateEvaluator with `evaluator_id`.
    pub(crate) async fn accept_evaluator(&mut self, evaluator_id: u64) -> CreateEvaluator {
        let create = self.expect_create().await;
        self.send(IncomingMessage::CreateEvaluatorResponse(
            CreateEvaluatorResponse {
                request_id: create.request_id,
                evaluator_id: Some(evaluator_id),
                error: None,
            },
        ))
        .await;
        create
    }

    pub(crate) async fn respond_value(&mut self, evaluate: &Evaluate, value: &Value) {
        let result = value::encode_to_vec(value).unwrap();
        self.send(IncomingMessage::EvaluateResponse(EvaluateResponse {
            request_id: evaluate.request_id,
            evaluator_id: evaluate.evaluator_id,
            result: Some(result.into()),
            error: None,
        }))
        .await;
    }

    pub(crate) async fn respond_error(&mut self, evaluate: &Evaluate, error: &str) {
        self.send(IncomingMessage::EvaluateResponse(EvaluateResponse {
            request_id: evaluate.request_id,
            evaluator_id: evaluate.evaluator_id,
            result: None,
            error: Some(error.to_string()),
        }))
        .await;
    }

    /// Close the evaluator's output; the client sees end of stream.
    pub(crate) async fn hang_up(&mut self) {
        self.sink.close().await.unwrap();
    }
}

/// A manager wired to a [`FakePkl`] instead of a real process.
pub(crate) fn fake_manager() -> (EvaluatorManager, FakePkl) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);

    let spawner = DuplexSpawner {
        connection: Mutex::new(Some(SpawnedEvaluator::new(client_read, client_write))),
    };
    let manager = EvaluatorManager::new(ManagerConfig::new().with_spawner(Arc::new(spawner)));
    let pkl = FakePkl {
        frames: FramedRead::new(server_read, MsgPackCodec::new()),
        sink: FramedWrite::new(server_write, MsgPackCodec::new()),
    };
    (manager, pkl)
}
