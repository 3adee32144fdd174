use crate::manager::SpawnError;
use crate::project::ProjectError;
use crate::value::DecodeError;

#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    /// The evaluator reported an error for this evaluation. The evaluator
    /// stays usable.
    #[error("{0}")]
    Evaluation(String),
    #[error("failed to create evaluator: {0}")]
    Create(String),
    #[error("evaluator {0} is closed")]
    SessionClosed(u64),
    #[error("request cancelled: evaluator closed")]
    Cancelled,
    #[error("evaluator manager closed")]
    ManagerClosed,
    #[error("evaluator process connection lost: {0}")]
    TransportClosed(String),
    #[error("failed to start evaluator process: {0}")]
    Spawn(#[from] SpawnError),
    #[error("failed to decode result: {0}")]
    Decode(#[from] DecodeError),
    #[error("I/O error talking to evaluator: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid project: {0}")]
    Project(#[from] ProjectError),
}

/// Why every outstanding call on a manager is being failed.
#[derive(Debug, Clone)]
pub(crate) enum CloseReason {
    ManagerClosed,
    TransportClosed(String),
}

impl CloseReason {
    pub(crate) fn to_error(&self) -> EvaluatorError {
        match self {
            Self::ManagerClosed => EvaluatorError::ManagerClosed,
            Self::TransportClosed(reason) => EvaluatorError::TransportClosed(reason.clone()),
        }
    }
}
