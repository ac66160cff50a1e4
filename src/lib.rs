//! On-device LLM inference engine core.
//!
//! Owns the lifecycle of two native inference runtimes: a vendor NPU
//! accelerator and a portable CPU runner. The engine picks a backend
//! with retries and fallback, runs one generation at a time with
//! streaming, stop and slow-generation notices, and tears native state
//! down safely, including under timeouts and process shutdown.
//!
//! The native runtimes themselves are supplied by the embedder through
//! [`AcceleratorProvider`] and [`CpuProvider`].

pub mod config;
pub mod constants;
pub mod error;
pub mod runtime;
pub mod service;
pub mod telemetry;

pub use config::{EngineConfig, LoggingConfig, Settings};
pub use error::{EngineError, InferError, InitError, LifecycleError, Result};
pub use runtime::{
    AcceleratorProvider, BackendHandle, BackendKind, BackendSelector, CpuProvider,
    GenerationSession, LifecycleCoordinator, PendingResult, SessionMode, SessionState,
    StreamingCallback,
};
pub use service::LlmEngineService;
