//! Error types for the Breeze engine.

use std::result;
use std::time::Duration;
use thiserror::Error;

/// A specialized Result type for engine operations.
pub type Result<T> = result::Result<T, EngineError>;

/// Lifecycle rejections raised before any native work is queued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Cleanup in progress")]
    CleanupInProgress,

    #[error("A generation session is already running")]
    SessionBusy,

    #[error("Backend handle used after release")]
    UseAfterRelease,

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),
}

/// Backend initialization failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("Native library unavailable: {0}")]
    NativeLibraryUnavailable(String),

    #[error("Model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("Initialization timed out after {0:?}")]
    Timeout(Duration),

    #[error("All backends failed: {0}")]
    AllBackendsFailed(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Inference failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferError {
    #[error("Backend not ready")]
    BackendNotReady,

    #[error("Native fault: {0}")]
    NativeFault(String),

    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// The error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Infer(#[from] InferError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging setup failed: {0}")]
    Telemetry(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl EngineError {
    /// The lifecycle rejection behind this error, if any.
    pub fn lifecycle(&self) -> Option<&LifecycleError> {
        match self {
            EngineError::Lifecycle(e)
            | EngineError::Init(InitError::Lifecycle(e))
            | EngineError::Infer(InferError::Lifecycle(e)) => Some(e),
            _ => None,
        }
    }
}

/// Converts a caught panic payload into a readable message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown native panic".to_string()
    }
}
