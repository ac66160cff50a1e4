//! Caller-facing engine service
//!
//! Thin async facade over the [`LifecycleCoordinator`]. Lifecycle
//! rejections (busy, cleanup in progress) come back as errors. Generation
//! failures never do: they resolve to partial text or
//! [`LLM_ERROR_RESPONSE`].

use parking_lot::RwLock;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::constants::limits::TOKEN_CHANNEL_CAPACITY;
use crate::constants::responses::LLM_ERROR_RESPONSE;
use crate::error::{EngineError, InferError, Result};
use crate::runtime::{
    AcceleratorProvider, BackendKind, BackendSelector, ChannelCallback, CpuProvider,
    GenerationSession, LifecycleCoordinator, PendingResult, SessionMode, StreamingCallback, TokenCallback,
};

/// Display name reported for the accelerator's bundled model
const ACCELERATOR_MODEL_NAME: &str = "Breeze2";

pub struct LlmEngineService {
    coordinator: Arc<LifecycleCoordinator>,
    config: RwLock<EngineConfig>,
}

impl LlmEngineService {
    /// Create a service with its own coordinator over the given runtimes
    pub fn new(
        config: EngineConfig,
        accelerator: Option<Arc<dyn AcceleratorProvider>>,
        cpu: Option<Arc<dyn CpuProvider>>,
    ) -> Result<Self> {
        let selector = BackendSelector::new(accelerator, cpu);
        let coordinator = LifecycleCoordinator::new(selector, config.clone())?;
        Ok(Self::with_coordinator(config, coordinator))
    }

    /// Create a service over a shared coordinator
    pub fn with_coordinator(config: EngineConfig, coordinator: Arc<LifecycleCoordinator>) -> Self {
        Self {
            coordinator,
            config: RwLock::new(config),
        }
    }

    pub fn coordinator(&self) -> &Arc<LifecycleCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// Initialize with `config`, which also becomes the service's config.
    /// Returns whether a backend is ready.
    pub async fn initialize(&self, config: EngineConfig) -> bool {
        if let Err(e) = config.validate() {
            warn!("Rejecting engine config: {}", e);
            return false;
        }
        *self.config.write() = config.clone();

        match self.coordinator.initialize(config).await {
            Ok(kind) => {
                info!("Engine ready on {} backend", kind);
                true
            }
            Err(e) => {
                warn!("Engine initialization failed: {}", e);
                false
            }
        }
    }

    /// Re-run initialization with the current config
    pub async fn reinitialize(&self) -> bool {
        self.initialize(self.config()).await
    }

    /// Generate a full response, waiting at most the generation timeout
    pub async fn generate_response(&self, prompt: &str) -> Result<String> {
        let (session, pending) = match self.start(prompt, SessionMode::Blocking, None)? {
            Some(started) => started,
            None => return Ok(LLM_ERROR_RESPONSE.to_string()),
        };

        let limit = self.config.read().generation_timeout();
        match tokio::time::timeout(limit, pending).await {
            Ok(text) => Ok(text),
            Err(_) => {
                warn!("Response not ready after {:?}", limit);
                let partial = session.partial_text();
                Ok(if partial.is_empty() {
                    LLM_ERROR_RESPONSE.to_string()
                } else {
                    partial
                })
            }
        }
    }

    /// Generate a response, forwarding tokens to `on_token` as they arrive
    pub async fn generate_streaming_response<C>(&self, prompt: &str, on_token: C) -> Result<String>
    where
        C: StreamingCallback + 'static,
    {
        let on_token: TokenCallback = Arc::new(on_token);
        match self.start(prompt, SessionMode::Streaming, Some(Arc::clone(&on_token)))? {
            Some((_, pending)) => Ok(pending.await),
            None => {
                on_token.on_token(LLM_ERROR_RESPONSE);
                Ok(LLM_ERROR_RESPONSE.to_string())
            }
        }
    }

    /// Stream tokens over a channel; the pending result resolves to the
    /// final text once generation settles
    pub fn generate_stream(&self, prompt: &str) -> Result<(ReceiverStream<String>, PendingResult)> {
        let (callback, stream) = ChannelCallback::channel(TOKEN_CHANNEL_CAPACITY);
        let (_, pending) = self
            .coordinator
            .start_session(prompt, SessionMode::Streaming, Some(Arc::new(callback)))?;
        Ok((stream, pending))
    }

    /// Start a session; `None` means no backend is ready
    fn start(
        &self,
        prompt: &str,
        mode: SessionMode,
        on_token: Option<TokenCallback>,
    ) -> Result<Option<(Arc<GenerationSession>, PendingResult)>> {
        match self.coordinator.start_session(prompt, mode, on_token) {
            Ok(started) => Ok(Some(started)),
            Err(EngineError::Infer(InferError::BackendNotReady)) => {
                warn!("Generation requested before a backend is ready");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn stop_generation(&self) {
        if !self.coordinator.stop_generation() {
            info!("No generation to stop");
        }
    }

    pub async fn release_resources(&self) {
        self.coordinator.release_all().await;
    }

    pub fn current_backend(&self) -> BackendKind {
        self.coordinator.current_backend()
    }

    pub fn is_ready(&self) -> bool {
        self.coordinator.is_ready()
    }

    /// Change the preferred backend. A change releases the current backend;
    /// call [`Self::reinitialize`] to bring the new one up.
    pub async fn set_preferred_backend(&self, kind: BackendKind) {
        let changed = {
            let mut config = self.config.write();
            let changed = config.preferred_backend != kind;
            config.preferred_backend = kind;
            changed
        };
        if changed {
            info!("Preferred backend set to {}", kind);
            self.coordinator.release_all().await;
        }
    }

    /// Display name of the loaded model
    pub fn model_name(&self) -> String {
        let config = self.config.read();
        match config.model_path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) if !stem.is_empty() => stem.to_string(),
            _ if self.current_backend() == BackendKind::Accelerator => {
                ACCELERATOR_MODEL_NAME.to_string()
            }
            _ => "Unknown".to_string(),
        }
    }

    pub async fn on_process_shutdown(&self) {
        self.coordinator.on_process_shutdown().await;
    }
}
