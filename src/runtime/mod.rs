//! Runtime layer wrapping the native inference backends
//!
//! The native runtimes are reached through the provider traits in
//! [`provider`]. Everything above them (handles, sessions, selection and
//! cleanup) lives in this module.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod accelerator;
pub mod cpu;
pub mod handle;
pub mod lifecycle;
pub mod provider;
pub mod selector;
pub mod session;
pub mod slot;
pub mod streaming;
pub mod worker;

pub use accelerator::AcceleratorBackend;
pub use cpu::{seq_len_hint, CpuBackend};
pub use handle::{BackendHandle, NativeBackend};
pub use lifecycle::LifecycleCoordinator;
pub use provider::{AcceleratorProvider, CpuProvider};
pub use selector::{BackendSelector, Selection};
pub use session::{GenerationSession, PendingResult, SessionMode, SessionRequest, SessionState};
pub use slot::ResultSlot;
pub use streaming::{ChannelCallback, CollectingCallback, StreamingCallback, TokenCallback};
pub use worker::{NativeWorker, WorkerError};

/// Which native runtime currently owns the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Nothing initialized
    #[default]
    None,
    /// Vendor NPU runtime
    #[serde(alias = "mtk", alias = "npu")]
    Accelerator,
    /// Portable CPU runtime
    #[serde(alias = "localcpu")]
    Cpu,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::None => "none",
            BackendKind::Accelerator => "accelerator",
            BackendKind::Cpu => "cpu",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(BackendKind::None),
            "accelerator" | "mtk" | "npu" => Ok(BackendKind::Accelerator),
            "cpu" | "localcpu" => Ok(BackendKind::Cpu),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}
