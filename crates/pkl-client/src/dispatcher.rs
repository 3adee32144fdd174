//! Correlation engine: the single read loop that routes evaluator frames.
//!
//! Flow:
//! 1. Read one frame from the evaluator's stdout
//! 2. Creation responses resolve a pending creation by request id; an
//!    evaluator created for a caller who gave up is closed again
//! 3. Everything else is routed to a session by evaluator id
//! 4. On end of stream or a read error: fail every outstanding call, exit
//!
//! The loop never awaits a reader. Reverse calls run on their own tasks so a
//! slow reader cannot hold up unrelated responses.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{
    CloseEvaluator, CreateEvaluatorResponse, IncomingMessage, MessageCode, OutgoingMessage,
    ReadRequest,
};
use crate::error::{CloseReason, EvaluatorError};
use crate::session::{ReverseCall, SessionState};
use crate::transport::{FrameReader, FrameWriter};

pub(crate) type PendingCreation = oneshot::Sender<Result<CreateEvaluatorResponse, EvaluatorError>>;

/// Routing table shared by the manager, its sessions and the read loop.
pub(crate) struct Routes {
    next_request_id: AtomicU64,
    pending_creations: DashMap<u64, PendingCreation>,
    /// Creations whose caller gave up before the response arrived.
    abandoned_creations: DashSet<u64>,
    sessions: DashMap<u64, Arc<SessionState>>,
    closed: OnceLock<CloseReason>,
}

impl Routes {
    pub(crate) fn new() -> Self {
        Self {
            next_request_id: AtomicU64::new(1),
            pending_creations: DashMap::new(),
            abandoned_creations: DashSet::new(),
            sessions: DashMap::new(),
            closed: OnceLock::new(),
        }
    }

    /// Fresh request id, unique among all calls on this transport.
    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn close_reason(&self) -> Option<&CloseReason> {
        self.closed.get()
    }

    /// Track a creation. Fails if the routes are already shut down, in which
    /// case nothing stays registered.
    ///
    /// Dropping the returned guard before the response arrives abandons the
    /// creation: the entry is removed and a late evaluator gets closed.
    pub(crate) fn register_creation(
        &self,
        request_id: u64,
        sender: PendingCreation,
    ) -> Result<CreationGuard<'_>, EvaluatorError> {
        self.pending_creations.insert(request_id, sender);
        // Re-check after inserting: shutdown may have drained before our insert.
        if let Some(reason) = self.close_reason() {
            self.pending_creations.remove(&request_id);
            return Err(reason.to_error());
        }
        Ok(CreationGuard {
            routes: self,
            request_id,
        })
    }

    pub(crate) fn insert_session(&self, session: Arc<SessionState>) -> Result<(), EvaluatorError> {
        let id = session.id();
        self.sessions.insert(id, Arc::clone(&session));
        if let Some(reason) = self.close_reason() {
            self.sessions.remove(&id);
            session.terminate_with(reason);
            return Err(reason.to_error());
        }
        Ok(())
    }

    pub(crate) fn remove_session(&self, evaluator_id: u64) {
        self.sessions.remove(&evaluator_id);
    }

    pub(crate) fn session(&self, evaluator_id: u64) -> Option<Arc<SessionState>> {
        self.sessions.get(&evaluator_id).map(|s| Arc::clone(s.value()))
    }

    /// Fail every outstanding call and stop routing. Only the first call has
    /// any effect.
    pub(crate) fn shutdown(&self, reason: CloseReason) {
        if self.closed.set(reason).is_err() {
            return;
        }
        let Some(reason) = self.closed.get() else {
            return;
        };

        self.abandoned_creations.clear();
        let creations: Vec<u64> = self.pending_creations.iter().map(|e| *e.key()).collect();
        for request_id in creations {
            if let Some((_, sender)) = self.pending_creations.remove(&request_id) {
                let _ = sender.send(Err(reason.to_error()));
            }
        }

        let sessions: Vec<u64> = self.sessions.iter().map(|e| *e.key()).collect();
        for evaluator_id in sessions {
            if let Some((_, session)) = self.sessions.remove(&evaluator_id) {
                session.terminate_with(reason);
            }
        }
        tracing::debug!(?reason, "Routes shut down");
    }

    /// Hand a creation response to its caller. Returns the id of an evaluator
    /// that was created for a caller who is gone, so it can be closed.
    fn resolve_creation(&self, response: CreateEvaluatorResponse) -> Option<u64> {
        let request_id = response.request_id;
        match self.pending_creations.remove(&request_id) {
            Some((_, sender)) => match sender.send(Ok(response)) {
                Ok(()) => None,
                Err(unclaimed) => {
                    tracing::debug!(request_id, "Creation caller went away before response");
                    unclaimed.ok().and_then(|response| response.evaluator_id)
                }
            },
            None if self.abandoned_creations.remove(&request_id).is_some() => {
                tracing::debug!(request_id, "Response for abandoned creation");
                response.evaluator_id
            }
            None => {
                tracing::warn!(request_id, "CreateEvaluatorResponse for unknown request");
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_creation_count(&self) -> usize {
        self.pending_creations.len()
    }
}

/// Keeps a creation registered while its caller waits for the response.
pub(crate) struct CreationGuard<'a> {
    routes: &'a Routes,
    request_id: u64,
}

impl CreationGuard<'_> {
    /// Drop the registration for a request that never reached the evaluator.
    pub(crate) fn withdraw(self) {
        self.routes.pending_creations.remove(&self.request_id);
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        let routes = self.routes;
        if routes.pending_creations.remove(&self.request_id).is_some()
            && routes.close_reason().is_none()
        {
            tracing::debug!(request_id = self.request_id, "Creation abandoned by caller");
            routes.abandoned_creations.insert(self.request_id);
        }
    }
}

pub(crate) struct Dispatcher {
    reader: FrameReader,
    writer: FrameWriter,
    routes: Arc<Routes>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(
        reader: FrameReader,
        writer: FrameWriter,
        routes: Arc<Routes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            writer,
            routes,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    tracing::debug!("Dispatcher cancelled");
                    break;
                }
                frame = self.reader.read_frame() => frame,
            };

            match frame {
                Ok(Some(msg)) => self.dispatch(msg),
                Ok(None) => {
                    tracing::warn!("Evaluator closed its output");
                    self.routes
                        .shutdown(CloseReason::TransportClosed("end of stream".to_string()));
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read frame from evaluator");
                    self.routes
                        .shutdown(CloseReason::TransportClosed(e.to_string()));
                    break;
                }
            }
        }
        tracing::info!("Dispatcher loop exiting");
    }

    fn dispatch(&self, msg: IncomingMessage) {
        match msg {
            IncomingMessage::CreateEvaluatorResponse(response) => {
                if let Some(evaluator_id) = self.routes.resolve_creation(response) {
                    self.close_orphan(evaluator_id);
                }
            }
            IncomingMessage::EvaluateResponse(response) => {
                if let Some(session) = self.session_for(response.evaluator_id, MessageCode::EvaluateResponse) {
                    session.resolve_evaluate(response);
                }
            }
            IncomingMessage::Log(log) => {
                if let Some(session) = self.session_for(log.evaluator_id, MessageCode::Log) {
                    session.log(log);
                }
            }
            IncomingMessage::ReadResource(req) => self.reverse_call(ReverseCall::ReadResource, req),
            IncomingMessage::ReadModule(req) => self.reverse_call(ReverseCall::ReadModule, req),
            IncomingMessage::ListResources(req) => self.reverse_call(ReverseCall::ListResources, req),
            IncomingMessage::ListModules(req) => self.reverse_call(ReverseCall::ListModules, req),
        }
    }

    fn session_for(&self, evaluator_id: u64, code: MessageCode) -> Option<Arc<SessionState>> {
        let session = self.routes.session(evaluator_id);
        if session.is_none() {
            tracing::warn!(evaluator_id, %code, "Frame for unknown evaluator, dropping");
        }
        session
    }

    /// Close an evaluator nobody holds a handle to.
    fn close_orphan(&self, evaluator_id: u64) {
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let msg = OutgoingMessage::CloseEvaluator(CloseEvaluator { evaluator_id });
            match writer.write_frame(msg).await {
                Ok(()) => tracing::info!(evaluator_id, "Closed evaluator with no caller"),
                Err(e) => tracing::debug!(
                    evaluator_id,
                    error = %e,
                    "Failed to close evaluator with no caller"
                ),
            }
        });
    }

    /// Answer a read or list on its own task; the loop never waits for it.
    fn reverse_call(&self, call: ReverseCall, req: ReadRequest) {
        let Some(session) = self.session_for(req.evaluator_id, call.code()) else {
            return;
        };
        tracing::debug!(
            evaluator_id = req.evaluator_id,
            request_id = req.request_id,
            uri = %req.uri,
            ?call,
            "Reverse call"
        );
        tokio::spawn(session.answer(call, req));
    }
}
