use std::sync::Arc;

use crate::key::StateKey;

/// Unified error type for engine operations.
#[derive(Debug, thiserror::Error, Clone)]
pub enum EngineError {
    #[error("invalid tree: {0}")]
    InvalidTree(String),

    #[error("state not found: {0}")]
    StateNotFound(StateKey),

    #[error("invalid lifecycle operation: {0}")]
    InvalidLifecycle(String),

    #[error("data value accessed after close")]
    UseAfterClose,

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("invalid timer interval: {0}")]
    InvalidTimerInterval(String),

    #[error("redirect error: {0}")]
    RedirectError(String),

    #[error("handler error: {0}")]
    HandlerError(Arc<dyn std::error::Error + Send + Sync>),

    #[error("snapshot does not match tree topology: {0}")]
    MismatchedActivePath(String),

    #[error("unknown state in snapshot: {0}")]
    UnknownState(String),

    #[error("engine is disposed")]
    Disposed,

    #[error("engine actor task is no longer running")]
    ChannelClosed,

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("json error: {0}")]
    Json(Arc<serde_json::Error>),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Json(Arc::new(e))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
