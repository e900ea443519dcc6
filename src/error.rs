use thiserror::Error;

use crate::types::{MatchStatus, ReviewStatus};

/// Failures surfaced by bracket operations. Every variant aborts the
/// surrounding transaction.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The operation does not apply to the match's current status.
    #[error("cannot {operation} a match that is {status}")]
    InvalidTransition {
        operation: &'static str,
        status: MatchStatus,
    },

    /// The report was already reviewed or superseded.
    #[error("cannot {operation} a report that is {review}")]
    ReportAlreadyReviewed {
        operation: &'static str,
        review: ReviewStatus,
    },

    /// Malformed scores, foreign winner, empty seed list.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    /// A bug in wiring or propagation. Never caused by the caller.
    #[error("topology invariant violated: {0}")]
    TopologyInvariantViolated(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error("actor {actor} is not allowed to mutate this bracket")]
    Forbidden { actor: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<u64>) -> Self {
        EngineError::NotFound { kind, id: id.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidTransition { .. } | EngineError::ReportAlreadyReviewed { .. } => {
                "invalid_transition"
            }
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::PreconditionViolated(_) => "precondition_violated",
            EngineError::TopologyInvariantViolated(_) => "internal",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Forbidden { .. } => "forbidden",
            EngineError::Storage(_) => "internal",
        }
    }

    /// Message safe to hand to end users.
    pub fn public_message(&self) -> String {
        match self {
            EngineError::TopologyInvariantViolated(_) | EngineError::Storage(_) => {
                "The bracket could not be updated due to an internal error.".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            EngineError::TopologyInvariantViolated(_) | EngineError::Storage(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
