//! One evaluator session: pending evaluations, reverse calls and close.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use indexmap::IndexMap;
use tokio::sync::oneshot;
use url::Url;

use crate::bridge::protocol::{
    CloseEvaluator, Evaluate, EvaluateResponse, ListResponse, Log, MessageCode, OutgoingMessage,
    PathElement, ReadModuleResponse, ReadRequest, ReadResourceResponse,
};
use crate::dispatcher::Routes;
use crate::error::{CloseReason, EvaluatorError};
use crate::logging::{LogLevel, Logger};
use crate::module_source::ModuleSource;
use crate::reader::{ModuleReader, Reader, ReaderRegistry, ResourceReader};
use crate::transport::FrameWriter;
use crate::value::{self, Value};

const OUTPUT_FILES_EXPR: &str = "output.files.toMap().mapValues((_, it) -> it.text)";

type PendingEvaluate = oneshot::Sender<Result<Bytes, EvaluatorError>>;

/// Read or list request issued by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReverseCall {
    ReadResource,
    ReadModule,
    ListResources,
    ListModules,
}

impl ReverseCall {
    pub(crate) fn code(self) -> MessageCode {
        match self {
            Self::ReadResource => MessageCode::ReadResource,
            Self::ReadModule => MessageCode::ReadModule,
            Self::ListResources => MessageCode::ListResources,
            Self::ListModules => MessageCode::ListModules,
        }
    }
}

#[derive(Debug)]
enum SessionEnd {
    /// Closed through `Evaluator::close`.
    Closed,
    /// The whole manager went down.
    Manager(CloseReason),
}

impl SessionEnd {
    fn rejection(&self, evaluator_id: u64) -> EvaluatorError {
        match self {
            Self::Closed => EvaluatorError::SessionClosed(evaluator_id),
            Self::Manager(reason) => reason.to_error(),
        }
    }

    fn cancellation(&self) -> EvaluatorError {
        match self {
            Self::Closed => EvaluatorError::Cancelled,
            Self::Manager(reason) => reason.to_error(),
        }
    }
}

/// Session internals shared between `Evaluator` handles and the dispatcher.
pub(crate) struct SessionState {
    id: u64,
    end: OnceLock<SessionEnd>,
    pending: DashMap<u64, PendingEvaluate>,
    resource_readers: ReaderRegistry<dyn ResourceReader>,
    module_readers: ReaderRegistry<dyn ModuleReader>,
    logger: Arc<dyn Logger>,
    writer: FrameWriter,
    routes: Weak<Routes>,
}

impl SessionState {
    pub(crate) fn new(
        id: u64,
        resource_readers: ReaderRegistry<dyn ResourceReader>,
        module_readers: ReaderRegistry<dyn ModuleReader>,
        logger: Arc<dyn Logger>,
        writer: FrameWriter,
        routes: Weak<Routes>,
    ) -> Self {
        Self {
            id,
            end: OnceLock::new(),
            pending: DashMap::new(),
            resource_readers,
            module_readers,
            logger,
            writer,
            routes,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Mark the session ended and fail its pending calls. Returns false if it
    /// had already ended.
    fn terminate(&self, end: SessionEnd) -> bool {
        if self.end.set(end).is_err() {
            return false;
        }
        let Some(end) = self.end.get() else {
            return false;
        };
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for request_id in ids {
            if let Some((_, sender)) = self.pending.remove(&request_id) {
                let _ = sender.send(Err(end.cancellation()));
            }
        }
        true
    }

    pub(crate) fn terminate_with(&self, reason: &CloseReason) {
        if self.terminate(SessionEnd::Manager(reason.clone())) {
            tracing::debug!(evaluator_id = self.id, ?reason, "Session terminated");
        }
    }

    pub(crate) fn resolve_evaluate(&self, response: EvaluateResponse) {
        let request_id = response.request_id;
        let Some((_, sender)) = self.pending.remove(&request_id) else {
            tracing::warn!(
                evaluator_id = self.id,
                request_id,
                "EvaluateResponse for unknown request"
            );
            return;
        };

        let result = match (response.error.filter(|e| !e.is_empty()), response.result) {
            (Some(error), _) => Err(EvaluatorError::Evaluation(error)),
            (None, Some(result)) => Ok(result),
            (None, None) => Err(EvaluatorError::Protocol(
                "evaluate response carries neither result nor error".to_string(),
            )),
        };
        if sender.send(result).is_err() {
            tracing::debug!(evaluator_id = self.id, request_id, "Evaluate caller went away");
        }
    }

    pub(crate) fn log(&self, log: Log) {
        match LogLevel::from_wire(log.level) {
            Some(level) => self.logger.log(level, &log.message, &log.frame_uri),
            None => tracing::warn!(
                evaluator_id = self.id,
                level = log.level,
                "Log frame with unknown level, dropping"
            ),
        }
    }

    /// Run a reverse call against the registered readers and write the
    /// answer. Every failure, including a panicking reader, becomes an error
    /// response.
    pub(crate) async fn answer(self: Arc<Self>, call: ReverseCall, req: ReadRequest) {
        let ReadRequest {
            request_id,
            evaluator_id,
            uri,
        } = req;

        let response = match call {
            ReverseCall::ReadResource => {
                let (contents, error) = split(read_resource(&self.resource_readers, &uri).await);
                OutgoingMessage::ReadResourceResponse(ReadResourceResponse {
                    request_id,
                    evaluator_id,
                    contents: contents.map(Bytes::from),
                    error,
                })
            }
            ReverseCall::ReadModule => {
                let (contents, error) = split(read_module(&self.module_readers, &uri).await);
                OutgoingMessage::ReadModuleResponse(ReadModuleResponse {
                    request_id,
                    evaluator_id,
                    contents,
                    error,
                })
            }
            ReverseCall::ListResources => {
                let (path_elements, error) = split(list(&self.resource_readers, &uri).await);
                OutgoingMessage::ListResourcesResponse(ListResponse {
                    request_id,
                    evaluator_id,
                    path_elements,
                    error,
                })
            }
            ReverseCall::ListModules => {
                let (path_elements, error) = split(list(&self.module_readers, &uri).await);
                OutgoingMessage::ListModulesResponse(ListResponse {
                    request_id,
                    evaluator_id,
                    path_elements,
                    error,
                })
            }
        };

        if let Err(e) = self.writer.write_frame(response).await {
            tracing::warn!(
                evaluator_id,
                request_id,
                error = %e,
                "Failed to answer reverse call"
            );
        }
    }
}

/// Removes an evaluate registration when its caller returns or is dropped.
/// A no-op once the dispatcher or a close has already taken the entry.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, PendingEvaluate>,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

fn split<T>(result: Result<T, String>) -> (Option<T>, Option<String>) {
    match result {
        Ok(value) => (Some(value), None),
        Err(error) => (None, Some(error)),
    }
}

/// Find the reader for `uri`. The scheme is matched as written in the URI,
/// before parsing lowercases it.
fn locate<'a, R: Reader + ?Sized>(
    registry: &'a ReaderRegistry<R>,
    uri: &str,
) -> Result<(Url, &'a Arc<R>), String> {
    let url = Url::parse(uri).map_err(|e| format!("internal error: failed to parse uri: {e}"))?;
    let scheme = uri.split_once(':').map_or(url.scheme(), |(scheme, _)| scheme);
    let reader = registry
        .find(scheme)
        .ok_or_else(|| format!("no reader for scheme {scheme}"))?;
    Ok((url, reader))
}

async fn read_resource(
    registry: &ReaderRegistry<dyn ResourceReader>,
    uri: &str,
) -> Result<Vec<u8>, String> {
    let (url, reader) = locate(registry, uri)?;
    guarded(reader.read(&url)).await
}

async fn read_module(
    registry: &ReaderRegistry<dyn ModuleReader>,
    uri: &str,
) -> Result<String, String> {
    let (url, reader) = locate(registry, uri)?;
    guarded(reader.read(&url)).await
}

async fn list<R: Reader + ?Sized>(
    registry: &ReaderRegistry<R>,
    uri: &str,
) -> Result<Vec<PathElement>, String> {
    let (url, reader) = locate(registry, uri)?;
    guarded(reader.list_elements(&url)).await
}

/// Await a reader future, turning both errors and panics into messages.
async fn guarded<T>(fut: impl Future<Output = anyhow::Result<T>>) -> Result<T, String> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("reader panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("reader panicked: {s}")
    } else {
        "reader panicked".to_string()
    }
}

/// Handle to one evaluator living in the evaluator process.
///
/// Cheap to clone; all clones share the session. Evaluations on one
/// evaluator may run concurrently and complete in any order.
#[derive(Clone)]
pub struct Evaluator {
    state: Arc<SessionState>,
}

impl Evaluator {
    pub(crate) fn new(state: Arc<SessionState>) -> Self {
        Self { state }
    }

    /// Id assigned by the evaluator process.
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn is_closed(&self) -> bool {
        self.state.end.get().is_some()
    }

    /// Evaluate `expr` (or the whole module when `None`) and return the
    /// MessagePack encoded result.
    ///
    /// An evaluation error fails only this call; the evaluator stays open.
    pub async fn evaluate_expression_raw(
        &self,
        source: &ModuleSource,
        expr: Option<&str>,
    ) -> Result<Bytes, EvaluatorError> {
        let state = &self.state;
        if let Some(end) = state.end.get() {
            return Err(end.rejection(state.id));
        }
        let routes = state.routes.upgrade().ok_or(EvaluatorError::ManagerClosed)?;
        let request_id = routes.next_request_id();

        let (tx, rx) = oneshot::channel();
        state.pending.insert(request_id, tx);
        // A caller that stops waiting takes its entry with it.
        let _registration = PendingGuard {
            pending: &state.pending,
            request_id,
        };
        // Closed while registering: either we withdraw the call here, or close
        // already resolved it and rx holds the error.
        if let Some(end) = state.end.get() {
            if state.pending.remove(&request_id).is_some() {
                return Err(end.rejection(state.id));
            }
            return rx.await.unwrap_or(Err(EvaluatorError::Cancelled));
        }

        tracing::debug!(
            evaluator_id = state.id,
            request_id,
            module_uri = %source.module_uri(),
            expr = expr.unwrap_or("<module>"),
            "Evaluating"
        );
        let request = Evaluate {
            request_id,
            evaluator_id: state.id,
            module_uri: source.module_uri().to_string(),
            module_text: source.contents().map(str::to_string),
            expr: expr.map(str::to_string),
        };
        state
            .writer
            .write_frame(OutgoingMessage::Evaluate(request))
            .await?;

        rx.await.unwrap_or(Err(EvaluatorError::Cancelled))
    }

    pub async fn evaluate_expression(
        &self,
        source: &ModuleSource,
        expr: Option<&str>,
    ) -> Result<Value, EvaluatorError> {
        let bytes = self.evaluate_expression_raw(source, expr).await?;
        Ok(value::decode_slice(&bytes)?)
    }

    pub async fn evaluate_module(&self, source: &ModuleSource) -> Result<Value, EvaluatorError> {
        self.evaluate_expression(source, None).await
    }

    /// Render the module with its configured output format.
    pub async fn evaluate_output_text(&self, source: &ModuleSource) -> Result<String, EvaluatorError> {
        match self.evaluate_expression(source, Some("output.text")).await? {
            Value::String(text) => Ok(text),
            other => Err(unexpected("output.text", "a string", &other)),
        }
    }

    pub async fn evaluate_output_value(&self, source: &ModuleSource) -> Result<Value, EvaluatorError> {
        self.evaluate_expression(source, Some("output.value")).await
    }

    /// Render `output.files`: path to rendered text, in declaration order.
    pub async fn evaluate_output_files(
        &self,
        source: &ModuleSource,
    ) -> Result<IndexMap<String, String>, EvaluatorError> {
        let value = self.evaluate_expression(source, Some(OUTPUT_FILES_EXPR)).await?;
        let Value::Map(entries) = value else {
            return Err(unexpected("output.files", "a map", &value));
        };
        entries
            .into_iter()
            .map(|(path, text)| match (path, text) {
                (Value::String(path), Value::String(text)) => Ok((path, text)),
                (path, _) => Err(unexpected("output.files", "string paths and texts", &path)),
            })
            .collect()
    }

    /// Close the evaluator. Pending evaluations fail with
    /// [`EvaluatorError::Cancelled`]; later ones fail without reaching the
    /// evaluator process. Closing twice is a no-op.
    pub async fn close(&self) {
        let state = &self.state;
        if !state.terminate(SessionEnd::Closed) {
            return;
        }
        let Some(routes) = state.routes.upgrade() else {
            return;
        };
        routes.remove_session(state.id);
        if routes.close_reason().is_some() {
            return;
        }

        let msg = OutgoingMessage::CloseEvaluator(CloseEvaluator {
            evaluator_id: state.id,
        });
        match state.writer.write_frame(msg).await {
            Ok(()) => tracing::info!(evaluator_id = state.id, "Evaluator closed"),
            Err(e) => tracing::debug!(
                evaluator_id = state.id,
                error = %e,
                "Failed to send CloseEvaluator"
            ),
        }
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("id", &self.state.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn unexpected(context: &str, expected: &str, found: &Value) -> EvaluatorError {
    EvaluatorError::Protocol(format!("{context}: expected {expected}, got {found:?}"))
}
