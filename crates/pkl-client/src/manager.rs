//! Evaluator manager: owns the evaluator process and the read loop.
//!
//! Flow:
//! 1. First use spawns `pkl server` (or whatever the spawner provides)
//! 2. The dispatcher task starts reading its stdout
//! 3. Each `new_evaluator` sends CreateEvaluator and waits for the response
//! 4. `close` stops the loop, fails everything outstanding, kills the child

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::OutgoingMessage;
use crate::dispatcher::{Dispatcher, Routes};
use crate::error::{CloseReason, EvaluatorError};
use crate::module_source::ModuleSource;
use crate::options::EvaluatorOptions;
use crate::project::Project;
use crate::session::{Evaluator, SessionState};
use crate::transport::{BoxedReader, BoxedWriter, FrameWriter, Transport};

/// Environment variable overriding the evaluator command, split on spaces.
pub const PKL_EXEC_ENV: &str = "PKL_EXEC";

const DEFAULT_COMMAND: &str = "pkl";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0} not captured")]
    MissingPipe(&'static str),
    #[error("empty evaluator command")]
    EmptyCommand,
    #[error("unrecognized version output: {0:?}")]
    Version(String),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Byte streams to an evaluator process, plus the child to reap.
pub struct SpawnedEvaluator {
    /// The evaluator's output.
    pub reader: BoxedReader,
    /// The evaluator's input.
    pub writer: BoxedWriter,
    pub child: Option<Child>,
}

impl SpawnedEvaluator {
    pub fn new(
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
            child: None,
        }
    }
}

/// Extension point for how the evaluator process is started.
pub trait EvaluatorSpawner: Send + Sync {
    fn spawn(&self) -> Result<SpawnedEvaluator, SpawnError>;
}

/// Runs `<command> server` with piped stdio.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    command: Vec<String>,
}

impl CommandSpawner {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// `$PKL_EXEC` if set and non-empty, else `pkl` from `PATH`.
    pub fn from_env() -> Self {
        let command = std::env::var(PKL_EXEC_ENV)
            .ok()
            .map(|cmd| cmd.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|cmd| !cmd.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_COMMAND.to_string()]);
        Self::new(command)
    }

    /// Version reported by `<command> --version`.
    pub async fn version(&self) -> Result<semver::Version, SpawnError> {
        let (program, args) = self.command.split_first().ok_or(SpawnError::EmptyCommand)?;
        let output = Command::new(program)
            .args(args)
            .arg("--version")
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_version(&stdout).ok_or_else(|| SpawnError::Version(stdout.trim().to_string()))
    }
}

/// Extract the version from `Pkl 0.25.2 (macOS 14.0, native)`.
fn parse_version(output: &str) -> Option<semver::Version> {
    let (_, rest) = output.split_once("Pkl ")?;
    let version = rest.split_whitespace().next()?;
    semver::Version::parse(version).ok()
}

impl EvaluatorSpawner for CommandSpawner {
    fn spawn(&self) -> Result<SpawnedEvaluator, SpawnError> {
        let (program, args) = self.command.split_first().ok_or(SpawnError::EmptyCommand)?;
        tracing::info!(%program, ?args, "Spawning evaluator process");
        let mut child = Command::new(program)
            .args(args)
            .arg("server")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        Ok(SpawnedEvaluator {
            reader: Box::pin(stdout),
            writer: Box::pin(stdin),
            child: Some(child),
        })
    }
}

pub struct ManagerConfig {
    pub spawner: Arc<dyn EvaluatorSpawner>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            spawner: Arc::new(CommandSpawner::from_env()),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluator command without the trailing `server` argument.
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.spawner = Arc::new(CommandSpawner::new(command));
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn EvaluatorSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

enum Connection {
    NotStarted,
    Running(Running),
    Closed,
}

struct Running {
    writer: FrameWriter,
    child: Option<Child>,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
}

impl Running {
    async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Evaluator process already gone");
            }
        }
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(error = %e, "Failed to close evaluator input");
        }
        if let Some(mut child) = self.child.take() {
            match child.wait().await {
                Ok(status) => tracing::debug!(%status, "Evaluator process exited"),
                Err(e) => tracing::warn!(error = %e, "Failed to reap evaluator process"),
            }
        }
        if let Err(e) = self.dispatcher.await {
            tracing::warn!(error = %e, "Dispatcher task failed");
        }
    }
}

/// Owns one evaluator process and multiplexes any number of evaluators over
/// its stdio.
///
/// The process is started lazily by the first [`new_evaluator`] call.
///
/// [`new_evaluator`]: EvaluatorManager::new_evaluator
pub struct EvaluatorManager {
    config: ManagerConfig,
    routes: Arc<Routes>,
    connection: Mutex<Connection>,
}

impl Default for EvaluatorManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl EvaluatorManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            routes: Arc::new(Routes::new()),
            connection: Mutex::new(Connection::NotStarted),
        }
    }

    /// Start the evaluator process and the read loop if not running yet.
    ///
    /// A spawn failure leaves the manager unstarted, so a later call may
    /// retry.
    pub async fn start(&self) -> Result<(), EvaluatorError> {
        self.writer().await.map(|_| ())
    }

    async fn writer(&self) -> Result<FrameWriter, EvaluatorError> {
        let mut connection = self.connection.lock().await;
        match &*connection {
            Connection::Running(running) => return Ok(running.writer.clone()),
            Connection::Closed => return Err(EvaluatorError::ManagerClosed),
            Connection::NotStarted => {}
        }

        let spawned = self.config.spawner.spawn()?;
        let (reader, writer) = Transport::new(spawned.reader, spawned.writer).split();
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            reader,
            writer.clone(),
            Arc::clone(&self.routes),
            cancel.clone(),
        );
        let dispatcher = tokio::spawn(dispatcher.run());
        tracing::info!("Evaluator process started");

        *connection = Connection::Running(Running {
            writer: writer.clone(),
            child: spawned.child,
            cancel,
            dispatcher,
        });
        Ok(writer)
    }

    /// Create an evaluator with the given options.
    pub async fn new_evaluator(&self, options: EvaluatorOptions) -> Result<Evaluator, EvaluatorError> {
        let writer = self.writer().await?;
        let request_id = self.routes.next_request_id();

        let (tx, rx) = oneshot::channel();
        let registration = self.routes.register_creation(request_id, tx)?;

        tracing::debug!(request_id, "Creating evaluator");
        let request = options.to_create_request(request_id);
        if let Err(e) = writer.write_frame(OutgoingMessage::CreateEvaluator(request)).await {
            registration.withdraw();
            return Err(e.into());
        }

        let response = rx.await.map_err(|_| EvaluatorError::ManagerClosed)??;
        drop(registration);
        if let Some(error) = response.error.filter(|e| !e.is_empty()) {
            tracing::warn!(request_id, %error, "Evaluator creation failed");
            return Err(EvaluatorError::Create(error));
        }
        let evaluator_id = response.evaluator_id.ok_or_else(|| {
            EvaluatorError::Protocol("CreateEvaluatorResponse without evaluatorId".to_string())
        })?;

        let state = Arc::new(SessionState::new(
            evaluator_id,
            options.resource_readers.clone(),
            options.module_readers.clone(),
            options.logger(),
            writer,
            Arc::downgrade(&self.routes),
        ));
        self.routes.insert_session(Arc::clone(&state))?;
        tracing::info!(evaluator_id, request_id, "Evaluator created");
        Ok(Evaluator::new(state))
    }

    /// Create an evaluator configured by the `PklProject` in `project_dir`.
    ///
    /// Options already set in `options` win over the project's evaluator
    /// settings.
    pub async fn new_project_evaluator(
        &self,
        project_dir: impl AsRef<Path>,
        options: EvaluatorOptions,
    ) -> Result<Evaluator, EvaluatorError> {
        let project = self.load_project(project_dir.as_ref()).await?;
        self.new_evaluator(options.with_project(&project)).await
    }

    /// Evaluate `<project_dir>/PklProject` with a throwaway evaluator.
    pub async fn load_project(&self, project_dir: &Path) -> Result<Project, EvaluatorError> {
        let source = ModuleSource::file(project_dir.join("PklProject"))?;
        let evaluator = self.new_evaluator(EvaluatorOptions::preconfigured()).await?;
        let value = evaluator.evaluate_output_value(&source).await;
        evaluator.close().await;
        Ok(Project::from_value(&value?)?)
    }

    /// Close every evaluator and stop the evaluator process. Outstanding
    /// calls fail with [`EvaluatorError::ManagerClosed`]. Idempotent.
    pub async fn close(&self) {
        self.routes.shutdown(CloseReason::ManagerClosed);
        let previous = {
            let mut connection = self.connection.lock().await;
            std::mem::replace(&mut *connection, Connection::Closed)
        };
        if let Connection::Running(running) = previous {
            running.stop().await;
            tracing::info!("Evaluator manager closed");
        }
    }

    /// True once the manager was closed or lost its evaluator process.
    pub fn is_closed(&self) -> bool {
        self.routes.close_reason().is_some()
    }
}

impl Drop for EvaluatorManager {
    fn drop(&mut self) {
        self.routes.shutdown(CloseReason::ManagerClosed);
        if let Connection::Running(running) = self.connection.get_mut() {
            running.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use indexmap::IndexMap;
    use tokio::sync::Notify;
    use url::Url;

    use super::*;
    use crate::bridge::protocol::{
        CreateEvaluatorResponse, EvaluateResponse, IncomingMessage, ListResponse, Log,
        MessageCode, PathElement, ReadRequest, encode_message,
    };
    use crate::logging::{LogLevel, Logger};
    use crate::reader::{ModuleReader, Reader, ResourceReader};
    use crate::test_support::{FakePkl, fake_manager};
    use crate::value::{RawValue, TypedObject, Value};

    const STEP: Duration = Duration::from_secs(5);

    async fn open(
        manager: &EvaluatorManager,
        pkl: &mut FakePkl,
        evaluator_id: u64,
        options: EvaluatorOptions,
    ) -> Evaluator {
        let (evaluator, _) =
            tokio::join!(manager.new_evaluator(options), pkl.accept_evaluator(evaluator_id));
        evaluator.unwrap()
    }

    fn read_request(evaluator_id: u64, request_id: u64, uri: &str) -> ReadRequest {
        ReadRequest {
            request_id,
            evaluator_id,
            uri: uri.to_string(),
        }
    }

    /// Resources read as `read by <scheme>`; `fail:` errors and `explode:`
    /// panics. Modules echo their URI.
    struct EchoReader {
        scheme: &'static str,
    }

    #[async_trait]
    impl Reader for EchoReader {
        fn scheme(&self) -> &str {
            self.scheme
        }

        fn is_globbable(&self) -> bool {
            true
        }

        fn has_hierarchical_uris(&self) -> bool {
            true
        }

        async fn list_elements(&self, _uri: &Url) -> anyhow::Result<Vec<PathElement>> {
            Ok(vec![PathElement::file("a.pkl"), PathElement::directory("sub")])
        }
    }

    #[async_trait]
    impl ResourceReader for EchoReader {
        async fn read(&self, uri: &Url) -> anyhow::Result<Vec<u8>> {
            match self.scheme {
                "fail" => anyhow::bail!("cannot read {uri}"),
                "explode" => panic!("reader bug"),
                scheme => Ok(format!("read by {scheme}").into_bytes()),
            }
        }
    }

    #[async_trait]
    impl ModuleReader for EchoReader {
        fn is_local(&self) -> bool {
            true
        }

        async fn read(&self, uri: &Url) -> anyhow::Result<String> {
            Ok(format!("// {uri}\nfoo = 1"))
        }
    }

    /// Holds every read until released.
    struct GateReader {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl Reader for GateReader {
        fn scheme(&self) -> &str {
            "slow"
        }

        fn is_globbable(&self) -> bool {
            false
        }

        fn has_hierarchical_uris(&self) -> bool {
            false
        }

        async fn list_elements(&self, _uri: &Url) -> anyhow::Result<Vec<PathElement>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl ResourceReader for GateReader {
        async fn read(&self, _uri: &Url) -> anyhow::Result<Vec<u8>> {
            self.gate.notified().await;
            Ok(b"late".to_vec())
        }
    }

    #[derive(Default)]
    struct Recorder {
        lines: StdMutex<Vec<(LogLevel, String, String)>>,
    }

    impl Logger for Recorder {
        fn log(&self, level: LogLevel, message: &str, frame_uri: &str) {
            self.lines
                .lock()
                .unwrap()
                .push((level, message.to_string(), frame_uri.to_string()));
        }
    }

    #[tokio::test]
    async fn handshake_creates_evaluator() {
        let (manager, mut pkl) = fake_manager();
        let options = EvaluatorOptions::new()
            .with_allowed_modules(vec!["pkl:".into(), "repl:".into()])
            .with_module_reader(Arc::new(EchoReader { scheme: "customfs" }));

        let (evaluator, create) =
            tokio::join!(manager.new_evaluator(options), pkl.accept_evaluator(135));
        let evaluator = evaluator.unwrap();

        assert_eq!(evaluator.id(), 135);
        assert!(!evaluator.is_closed());
        assert_eq!(
            create.allowed_modules,
            Some(vec!["pkl:".to_string(), "repl:".to_string()])
        );
        let readers = create.client_module_readers.unwrap();
        assert_eq!(readers[0].scheme, "customfs");
        assert!(readers[0].is_local);
        assert!(create.client_resource_readers.is_none());
    }

    #[tokio::test]
    async fn creation_error_is_reported() {
        let (manager, mut pkl) = fake_manager();
        let server = async {
            let create = pkl.expect_create().await;
            pkl.send(IncomingMessage::CreateEvaluatorResponse(
                CreateEvaluatorResponse {
                    request_id: create.request_id,
                    evaluator_id: None,
                    error: Some("invalid module path".to_string()),
                },
            ))
            .await;
        };
        let (result, ()) = tokio::join!(manager.new_evaluator(EvaluatorOptions::new()), server);
        match result {
            Err(EvaluatorError::Create(msg)) => assert_eq!(msg, "invalid module path"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_evaluations_resolve_out_of_order() {
        let (manager, mut pkl) = fake_manager();
        let evaluator = open(&manager, &mut pkl, 1, EvaluatorOptions::new()).await;
        let source = ModuleSource::text("a = 1\nb = 2");

        let server = async {
            let first = pkl.expect_evaluate().await;
            let second = pkl.expect_evaluate().await;
            assert_ne!(first.request_id, second.request_id);
            for evaluate in [&second, &first] {
                let value = match evaluate.expr.as_deref() {
                    Some("a") => Value::Int(1),
                    Some("b") => Value::Int(2),
                    other => panic!("unexpected expr {other:?}"),
                };
                pkl.respond_value(evaluate, &value).await;
            }
            first
        };
        let (a, b, first) = tokio::join!(
            evaluator.evaluate_expression(&source, Some("a")),
            evaluator.evaluate_expression(&source, Some("b")),
            server,
        );

        assert_eq!(a.unwrap(), Value::Int(1));
        assert_eq!(b.unwrap(), Value::Int(2));
        assert_eq!(first.module_uri, "repl:text");
        assert_eq!(first.module_text.as_deref(), Some("a = 1\nb = 2"));
    }

    #[tokio::test]
    async fn stray_frames_are_dropped() {
        let (manager, mut pkl) = fake_manager();
        let evaluator = open(&manager, &mut pkl, 1, EvaluatorOptions::new()).await;
        let source = ModuleSource::text("x = 1");

        let server = async {
            let evaluate = pkl.expect_evaluate().await;
            pkl.send(IncomingMessage::EvaluateResponse(EvaluateResponse {
                request_id: 9999,
                evaluator_id: 1,
                result: None,
                error: Some("nobody asked".to_string()),
            }))
            .await;
            pkl.send(IncomingMessage::Log(Log {
                evaluator_id: 42,
                level: 0,
                message: "orphan".to_string(),
                frame_uri: String::new(),
            }))
            .await;
            pkl.send(IncomingMessage::CreateEvaluatorResponse(
                CreateEvaluatorResponse {
                    request_id: 777,
                    evaluator_id: Some(3),
                    error: None,
                },
            ))
            .await;
            pkl.respond_value(&evaluate, &Value::String("ok".into())).await;
        };
        let (result, ()) = tokio::join!(evaluator.evaluate_expression(&source, Some("x")), server);
        assert_eq!(result.unwrap(), Value::String("ok".into()));
    }

    #[tokio::test]
    async fn undecodable_frames_do_not_end_the_session() {
        let (manager, mut pkl) = fake_manager();
        let recorder = Arc::new(Recorder::default());
        let options = EvaluatorOptions::new().with_logger(recorder.clone());
        let evaluator = open(&manager, &mut pkl, 1, options).await;
        let source = ModuleSource::text("x = 1");

        let server = async {
            let evaluate = pkl.expect_evaluate().await;
            pkl.send_raw(&rmp_serde::to_vec(&(0x7fu8, ())).unwrap()).await;

            let mut fields = IndexMap::new();
            fields.insert("requestId".to_string(), RawValue::Int(evaluate.request_id as i64));
            let missing_evaluator_id =
                encode_message(MessageCode::EvaluateResponse, &fields).unwrap();
            pkl.send_raw(&missing_evaluator_id).await;

            pkl.send(IncomingMessage::Log(Log {
                evaluator_id: 1,
                level: 300,
                message: "too loud".to_string(),
                frame_uri: String::new(),
            }))
            .await;
            pkl.respond_value(&evaluate, &Value::Int(1)).await;
        };
        let (result, ()) = tokio::join!(evaluator.evaluate_module(&source), server);
        assert_eq!(result.unwrap(), Value::Int(1));
        assert!(!manager.is_closed());
        assert!(recorder.lines.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandoned_creation_closes_late_evaluator() {
        let (manager, mut pkl) = fake_manager();

        let attempt = tokio::time::timeout(
            Duration::from_millis(10),
            manager.new_evaluator(EvaluatorOptions::new()),
        )
        .await;
        assert!(attempt.is_err(), "no answer was sent, the call must time out");
        assert_eq!(manager.routes.pending_creation_count(), 0);

        let create = pkl.expect_create().await;
        pkl.send(IncomingMessage::CreateEvaluatorResponse(
            CreateEvaluatorResponse {
                request_id: create.request_id,
                evaluator_id: Some(9),
                error: None,
            },
        ))
        .await;
        match pkl.recv().await {
            OutgoingMessage::CloseEvaluator(close) => assert_eq!(close.evaluator_id, 9),
            other => panic!("expected CloseEvaluator, got {other:?}"),
        }

        // The manager is still usable.
        let evaluator = open(&manager, &mut pkl, 2, EvaluatorOptions::new()).await;
        assert_eq!(evaluator.id(), 2);
    }

    #[tokio::test]
    async fn evaluation_error_keeps_session_open() {
        let (manager, mut pkl) = fake_manager();
        let evaluator = open(&manager, &mut pkl, 1, EvaluatorOptions::new()).await;
        let source = ModuleSource::text("x = throw(\"boom\")");

        let server = async {
            let evaluate = pkl.expect_evaluate().await;
            pkl.respond_error(&evaluate, "-- Pkl Error --\nboom").await;
        };
        let (result, ()) = tokio::join!(evaluator.evaluate_module(&source), server);
        match result {
            Err(EvaluatorError::Evaluation(msg)) => assert!(msg.ends_with("boom")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!evaluator.is_closed());

        let server = async {
            let evaluate = pkl.expect_evaluate().await;
            pkl.respond_value(&evaluate, &Value::Bool(true)).await;
        };
        let (result, ()) = tokio::join!(evaluator.evaluate_module(&source), server);
        assert_eq!(result.unwrap(), Value::Bool(true));
    }

    #[tokio::test]
    async fn output_helpers_use_output_expressions() {
        let (manager, mut pkl) = fake_manager();
        let evaluator = open(&manager, &mut pkl, 1, EvaluatorOptions::new()).await;
        let source = ModuleSource::text("foo = 1");

        let server = async {
            let evaluate = pkl.expect_evaluate().await;
            assert_eq!(evaluate.expr.as_deref(), Some("output.text"));
            pkl.respond_value(&evaluate, &Value::String("foo = 1\n".into())).await;
        };
        let (text, ()) = tokio::join!(evaluator.evaluate_output_text(&source), server);
        assert_eq!(text.unwrap(), "foo = 1\n");

        let server = async {
            let evaluate = pkl.expect_evaluate().await;
            assert_eq!(
                evaluate.expr.as_deref(),
                Some("output.files.toMap().mapValues((_, it) -> it.text)")
            );
            let files = Value::Map(vec![
                (Value::String("b.yml".into()), Value::String("b: 2\n".into())),
                (Value::String("a.yml".into()), Value::String("a: 1\n".into())),
            ]);
            pkl.respond_value(&evaluate, &files).await;
        };
        let (files, ()) = tokio::join!(evaluator.evaluate_output_files(&source), server);
        let files = files.unwrap();
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["b.yml", "a.yml"]);
        assert_eq!(files["a.yml"], "a: 1\n");
    }

    #[tokio::test]
    async fn manager_close_wakes_pending_calls() {
        let (manager, mut pkl) = fake_manager();
        let evaluator = open(&manager, &mut pkl, 1, EvaluatorOptions::new()).await;
        let source = ModuleSource::text("x = 1");

        let closer = async {
            pkl.expect_evaluate().await;
            manager.close().await;
        };
        let (result, ()) = tokio::join!(evaluator.evaluate_module(&source), closer);
        assert!(matches!(result, Err(EvaluatorError::ManagerClosed)), "{result:?}");

        assert!(manager.is_closed());
        assert!(evaluator.is_closed());
        assert!(matches!(
            evaluator.evaluate_module(&source).await,
            Err(EvaluatorError::ManagerClosed)
        ));
        assert!(matches!(
            manager.new_evaluator(EvaluatorOptions::new()).await,
            Err(EvaluatorError::ManagerClosed)
        ));
        assert!(matches!(
            manager.start().await,
            Err(EvaluatorError::ManagerClosed)
        ));

        // Idempotent, and closing a session afterwards sends nothing.
        manager.close().await;
        evaluator.close().await;
        assert!(pkl.try_recv().await.is_none());
    }

    #[tokio::test]
    async fn session_close_cancels_and_rejects() {
        let (manager, mut pkl) = fake_manager();
        let evaluator = open(&manager, &mut pkl, 1, EvaluatorOptions::new()).await;
        let source = ModuleSource::text("x = 1");

        let closer = async {
            let evaluate = pkl.expect_evaluate().await;
            evaluator.close().await;
            evaluate
        };
        let (result, late) = tokio::join!(evaluator.evaluate_module(&source), closer);
        assert!(matches!(result, Err(EvaluatorError::Cancelled)), "{result:?}");

        match pkl.recv().await {
            OutgoingMessage::CloseEvaluator(close) => assert_eq!(close.evaluator_id, 1),
            other => panic!("expected CloseEvaluator, got {other:?}"),
        }

        // A late answer for the cancelled call is dropped.
        pkl.respond_value(&late, &Value::Int(1)).await;

        assert!(matches!(
            evaluator.evaluate_module(&source).await,
            Err(EvaluatorError::SessionClosed(1))
        ));
        evaluator.close().await;

        // Nothing was written for the rejected call or the second close.
        let other = open(&manager, &mut pkl, 2, EvaluatorOptions::new()).await;
        assert_eq!(other.id(), 2);
    }

    #[tokio::test]
    async fn end_of_stream_fails_outstanding_calls() {
        let (manager, mut pkl) = fake_manager();
        let evaluator = open(&manager, &mut pkl, 1, EvaluatorOptions::new()).await;
        let source = ModuleSource::text("x = 1");

        let server = async {
            pkl.expect_evaluate().await;
            pkl.hang_up().await;
        };
        let (result, ()) = tokio::join!(evaluator.evaluate_module(&source), server);
        assert!(matches!(result, Err(EvaluatorError::TransportClosed(_))), "{result:?}");

        assert!(manager.is_closed());
        assert!(matches!(
            manager.new_evaluator(EvaluatorOptions::new()).await,
            Err(EvaluatorError::TransportClosed(_))
        ));
        manager.close().await;
    }

    #[tokio::test]
    async fn reverse_calls_route_by_scheme() {
        let (manager, mut pkl) = fake_manager();
        let options = EvaluatorOptions::new()
            .with_resource_reader(Arc::new(EchoReader { scheme: "a" }))
            .with_resource_reader(Arc::new(EchoReader { scheme: "b" }));
        open(&manager, &mut pkl, 1, options).await;

        let cases = [
            (10, "a:one", Ok("read by a")),
            (11, "b:two", Ok("read by b")),
            (12, "c:three", Err("no reader for scheme c")),
        ];
        for (request_id, uri, expected) in cases {
            pkl.send(IncomingMessage::ReadResource(read_request(1, request_id, uri)))
                .await;
            match pkl.recv().await {
                OutgoingMessage::ReadResourceResponse(resp) => {
                    assert_eq!(resp.request_id, request_id);
                    assert_eq!(resp.evaluator_id, 1);
                    match expected {
                        Ok(body) => {
                            assert_eq!(resp.contents.as_deref(), Some(body.as_bytes()));
                            assert!(resp.error.is_none());
                        }
                        Err(msg) => {
                            assert!(resp.contents.is_none());
                            assert_eq!(resp.error.as_deref(), Some(msg));
                        }
                    }
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn reader_failures_become_error_responses() {
        let (manager, mut pkl) = fake_manager();
        let options = EvaluatorOptions::new()
            .with_resource_reader(Arc::new(EchoReader { scheme: "fail" }))
            .with_resource_reader(Arc::new(EchoReader { scheme: "explode" }));
        open(&manager, &mut pkl, 1, options).await;

        let mut errors = Vec::new();
        for (request_id, uri) in [(1, "fail:thing"), (2, "explode:thing"), (3, "::not a uri")] {
            pkl.send(IncomingMessage::ReadResource(read_request(1, request_id, uri)))
                .await;
            match pkl.recv().await {
                OutgoingMessage::ReadResourceResponse(resp) => {
                    assert!(resp.contents.is_none());
                    errors.push(resp.error.unwrap());
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(errors[0], "cannot read fail:thing");
        assert_eq!(errors[1], "reader panicked: reader bug");
        assert!(errors[2].starts_with("internal error: failed to parse uri: "));
    }

    #[tokio::test]
    async fn module_reads_and_listings() {
        let (manager, mut pkl) = fake_manager();
        let options = EvaluatorOptions::new()
            .with_module_reader(Arc::new(EchoReader { scheme: "customfs" }))
            .with_resource_reader(Arc::new(EchoReader { scheme: "res" }));
        open(&manager, &mut pkl, 4, options).await;

        pkl.send(IncomingMessage::ReadModule(read_request(4, 1, "customfs:/lib.pkl")))
            .await;
        match pkl.recv().await {
            OutgoingMessage::ReadModuleResponse(resp) => {
                assert_eq!(resp.contents.as_deref(), Some("// customfs:/lib.pkl\nfoo = 1"));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        pkl.send(IncomingMessage::ListModules(read_request(4, 2, "customfs:/")))
            .await;
        let expected = ListResponse {
            request_id: 2,
            evaluator_id: 4,
            path_elements: Some(vec![PathElement::file("a.pkl"), PathElement::directory("sub")]),
            error: None,
        };
        assert_eq!(
            pkl.recv().await,
            OutgoingMessage::ListModulesResponse(expected)
        );

        pkl.send(IncomingMessage::ListResources(read_request(4, 3, "customfs:/")))
            .await;
        match pkl.recv().await {
            OutgoingMessage::ListResourcesResponse(resp) => {
                assert_eq!(resp.error.as_deref(), Some("no reader for scheme customfs"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_reader_does_not_block_responses() {
        let (manager, mut pkl) = fake_manager();
        let gate = Arc::new(Notify::new());
        let options = EvaluatorOptions::new().with_resource_reader(Arc::new(GateReader {
            gate: Arc::clone(&gate),
        }));
        let evaluator = open(&manager, &mut pkl, 1, options).await;
        let source = ModuleSource::text("x = read(\"slow:x\")");

        let server = async {
            let evaluate = pkl.expect_evaluate().await;
            pkl.send(IncomingMessage::ReadResource(read_request(1, 500, "slow:x")))
                .await;
            pkl.respond_value(&evaluate, &Value::Int(7)).await;
        };
        let (result, ()) = tokio::time::timeout(
            STEP,
            async { tokio::join!(evaluator.evaluate_module(&source), server) },
        )
        .await
        .expect("evaluate response was held up by the reader");
        assert_eq!(result.unwrap(), Value::Int(7));

        gate.notify_one();
        match pkl.recv().await {
            OutgoingMessage::ReadResourceResponse(resp) => {
                assert_eq!(resp.request_id, 500);
                assert_eq!(resp.contents.as_deref(), Some(&b"late"[..]));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn log_frames_reach_logger() {
        let (manager, mut pkl) = fake_manager();
        let recorder = Arc::new(Recorder::default());
        let options = EvaluatorOptions::new().with_logger(recorder.clone());
        let evaluator = open(&manager, &mut pkl, 1, options).await;
        let source = ModuleSource::text("x = trace(1)");

        let server = async {
            let evaluate = pkl.expect_evaluate().await;
            for (level, message) in [(0, "trace(1) = 1"), (7, "bogus"), (1, "deprecated")] {
                pkl.send(IncomingMessage::Log(Log {
                    evaluator_id: 1,
                    level,
                    message: message.to_string(),
                    frame_uri: "repl:text".to_string(),
                }))
                .await;
            }
            pkl.respond_value(&evaluate, &Value::Int(1)).await;
        };
        let (result, ()) = tokio::join!(evaluator.evaluate_module(&source), server);
        result.unwrap();

        let lines = recorder.lines.lock().unwrap();
        assert_eq!(
            *lines,
            vec![
                (LogLevel::Info, "trace(1) = 1".to_string(), "repl:text".to_string()),
                (LogLevel::Warn, "deprecated".to_string(), "repl:text".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn spawn_failure_leaves_manager_unstarted() {
        let manager = EvaluatorManager::new(
            ManagerConfig::new().with_command(vec!["/nonexistent/pkl-for-tests".to_string()]),
        );
        for _ in 0..2 {
            let result = manager.new_evaluator(EvaluatorOptions::new()).await;
            assert!(matches!(result, Err(EvaluatorError::Spawn(_))), "{result:?}");
        }
        assert!(!manager.is_closed());
        manager.close().await;
        assert!(matches!(
            manager.start().await,
            Err(EvaluatorError::ManagerClosed)
        ));
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = CommandSpawner::new(Vec::new()).spawn().err().unwrap();
        assert!(matches!(err, SpawnError::EmptyCommand));
    }

    #[test]
    fn version_is_parsed_from_banner() {
        assert_eq!(
            parse_version("Pkl 0.25.2 (macOS 14.0, native)\n"),
            Some(semver::Version::new(0, 25, 2))
        );
        let dev = parse_version("Pkl 0.26.0-dev+a1b2c3 (Linux 6.1, Java 17)").unwrap();
        assert_eq!(dev.pre.as_str(), "dev");
        assert_eq!(parse_version("pkl: command not found"), None);
        assert_eq!(parse_version("Pkl unknown"), None);
    }

    #[tokio::test]
    async fn version_needs_a_command() {
        let err = CommandSpawner::new(Vec::new()).version().await.unwrap_err();
        assert!(matches!(err, SpawnError::EmptyCommand));

        let err = CommandSpawner::new(vec!["/nonexistent/pkl-for-tests".to_string()])
            .version()
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::Spawn(_)));
    }

    #[tokio::test]
    async fn project_evaluator_applies_project_settings() {
        let (manager, mut pkl) = fake_manager();

        let settings = Value::Object(TypedObject {
            name: "EvaluatorSettings".into(),
            module_uri: "pkl:EvaluatorSettings".into(),
            properties: [(
                "allowedResources".to_string(),
                Value::List(vec![Value::String("env:".into())]),
            )]
            .into_iter()
            .collect(),
        });
        let project = Value::Object(TypedObject {
            name: "Project".into(),
            module_uri: "pkl:Project".into(),
            properties: [
                (
                    "projectFileUri".to_string(),
                    Value::String("file:///work/app/PklProject".into()),
                ),
                ("evaluatorSettings".to_string(), settings),
            ]
            .into_iter()
            .collect(),
        });

        let server = async {
            let helper = pkl.accept_evaluator(1).await;
            assert!(helper.allowed_modules.is_some());

            let evaluate = pkl.expect_evaluate().await;
            assert_eq!(evaluate.module_uri, "file:///work/app/PklProject");
            assert_eq!(evaluate.expr.as_deref(), Some("output.value"));
            pkl.respond_value(&evaluate, &project).await;

            match pkl.recv().await {
                OutgoingMessage::CloseEvaluator(close) => assert_eq!(close.evaluator_id, 1),
                other => panic!("expected CloseEvaluator, got {other:?}"),
            }
            pkl.accept_evaluator(2).await
        };
        let options = EvaluatorOptions::new().with_allowed_modules(vec!["file:".into()]);
        let (evaluator, create) =
            tokio::join!(manager.new_project_evaluator("/work/app", options), server);

        assert_eq!(evaluator.unwrap().id(), 2);
        assert_eq!(create.allowed_modules, Some(vec!["file:".to_string()]));
        assert_eq!(create.allowed_resources, Some(vec!["env:".to_string()]));
        let project = create.project.unwrap();
        assert_eq!(
            project.project_file_uri.as_deref(),
            Some("file:///work/app/PklProject")
        );
    }
}
