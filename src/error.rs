//! Engine error taxonomy
//!
//! Every operation of the runtime fails with an [`EngineError`]. Callers branch
//! on [`EngineError::kind`] only; the message is for humans.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::gguf::GgufError;
use crate::inference::ContextId;

/// Programmatic classification of an [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParams,
    ContextNotFound,
    DuplicateContext,
    ContextBusy,
    ModelLoadFailed,
    AdapterLoadFailed,
    SessionTooLarge,
    SessionIncompatible,
    GenerationFailed,
    Io,
    WorkerGone,
}

/// Errors that can occur during engine operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Context not found: {0}")]
    ContextNotFound(ContextId),

    #[error("Context already exists: {0}")]
    DuplicateContext(ContextId),

    #[error("Context {id} is busy: {reason}")]
    ContextBusy { id: ContextId, reason: String },

    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Failed to load adapter #{index}: {reason}")]
    AdapterLoadFailed { index: usize, reason: String },

    #[error("Session of {size} bytes exceeds the limit of {limit} bytes")]
    SessionTooLarge { size: u64, limit: u64 },

    #[error("Session incompatible with context: {0}")]
    SessionIncompatible(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Context worker stopped: {0}")]
    WorkerGone(String),
}

impl EngineError {
    /// Returns the kind used for control flow by callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidParams(_) => ErrorKind::InvalidParams,
            EngineError::ContextNotFound(_) => ErrorKind::ContextNotFound,
            EngineError::DuplicateContext(_) => ErrorKind::DuplicateContext,
            EngineError::ContextBusy { .. } => ErrorKind::ContextBusy,
            EngineError::ModelLoadFailed(_) => ErrorKind::ModelLoadFailed,
            EngineError::AdapterLoadFailed { .. } => ErrorKind::AdapterLoadFailed,
            EngineError::SessionTooLarge { .. } => ErrorKind::SessionTooLarge,
            EngineError::SessionIncompatible(_) => ErrorKind::SessionIncompatible,
            EngineError::GenerationFailed(_) => ErrorKind::GenerationFailed,
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::WorkerGone(_) => ErrorKind::WorkerGone,
        }
    }

    pub(crate) fn busy(id: ContextId, reason: impl Into<String>) -> Self {
        EngineError::ContextBusy {
            id,
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<GgufError> for EngineError {
    fn from(e: GgufError) -> Self {
        EngineError::ModelLoadFailed(e.to_string())
    }
}
