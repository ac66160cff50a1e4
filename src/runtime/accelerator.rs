//! Accelerator backend over the vendor NPU runtime
//!
//! The vendor runtime is fragile around init: a stale model from an
//! earlier session must be reset before `init_llm`, and a failed init
//! leaves state behind that has to be torn down before the next try.
//! After every generation the model is reset and swapped back to the
//! configured token budget.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::handle::{guard_native, NativeBackend};
use super::provider::AcceleratorProvider;
use super::BackendKind;
use crate::config::EngineConfig;
use crate::error::{InferError, InitError};

pub struct AcceleratorBackend {
    provider: Arc<dyn AcceleratorProvider>,
    config_path: PathBuf,
    preload_shared_weights: bool,
    swap_token_budget: usize,
    cleanup_pause: Duration,
}

impl AcceleratorBackend {
    pub fn new(provider: Arc<dyn AcceleratorProvider>, config: &EngineConfig) -> Self {
        Self {
            provider,
            config_path: config.accelerator_config_path.clone(),
            preload_shared_weights: config.preload_shared_weights,
            swap_token_budget: config.swap_token_budget,
            cleanup_pause: config.cleanup_pause(),
        }
    }

    /// Tear down whatever a failed init left behind
    fn cleanup_after_failed_init(&self) {
        if let Err(msg) = guard_native(|| self.provider.reset_llm()) {
            warn!("reset after failed init panicked: {}", msg);
        }
        thread::sleep(self.cleanup_pause);
        if let Err(msg) = guard_native(|| self.provider.release_llm()) {
            warn!("release after failed init panicked: {}", msg);
        }
    }
}

impl NativeBackend for AcceleratorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Accelerator
    }

    fn init(&self, config: &EngineConfig) -> Result<(), InitError> {
        if !config.accelerator_enabled {
            return Err(InitError::NativeLibraryUnavailable(
                "accelerator backend disabled".to_string(),
            ));
        }
        if !self.provider.is_available() {
            return Err(InitError::NativeLibraryUnavailable(
                "vendor runtime library not loaded".to_string(),
            ));
        }

        // Clear any model left over from an earlier session
        match guard_native(|| self.provider.reset_llm()) {
            Ok(true) => {}
            Ok(false) => debug!("Pre-init reset reported failure"),
            Err(msg) => debug!("Pre-init reset panicked: {}", msg),
        }

        info!("Initializing accelerator from {:?}", self.config_path);
        let outcome = guard_native(|| {
            self.provider
                .init_llm(&self.config_path, self.preload_shared_weights)
        });
        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.cleanup_after_failed_init();
                Err(InitError::ModelLoadFailed(
                    "accelerator init_llm returned false".to_string(),
                ))
            }
            Err(msg) => {
                self.cleanup_after_failed_init();
                Err(InitError::ModelLoadFailed(format!(
                    "accelerator init_llm panicked: {}",
                    msg
                )))
            }
        }
    }

    fn infer(&self, prompt: &str, max_tokens: usize) -> Result<String, InferError> {
        Ok(self.provider.inference(prompt, max_tokens, false))
    }

    fn infer_streaming(
        &self,
        prompt: &str,
        max_tokens: usize,
        sink: &mut dyn FnMut(&str),
    ) -> Result<String, InferError> {
        Ok(self
            .provider
            .streaming_inference(prompt, max_tokens, false, sink))
    }

    fn reset(&self) -> Result<(), InferError> {
        if self.provider.reset_llm() {
            Ok(())
        } else {
            Err(InferError::NativeFault(
                "accelerator reset_llm returned false".to_string(),
            ))
        }
    }

    /// Reset and swap back to the configured budget. Failures are logged
    /// and never change the outcome of the generation that just ran.
    fn after_generation(&self) {
        match guard_native(|| self.provider.reset_llm()) {
            Ok(true) => {}
            Ok(false) => warn!("Post-generation reset reported failure"),
            Err(msg) => warn!("Post-generation reset panicked: {}", msg),
        }
        match guard_native(|| self.provider.swap_model(self.swap_token_budget)) {
            Ok(true) => debug!(budget = self.swap_token_budget, "Model swapped"),
            Ok(false) => warn!("Model swap to {} tokens failed", self.swap_token_budget),
            Err(msg) => warn!("Model swap panicked: {}", msg),
        }
    }

    fn stop(&self) {
        // The vendor runtime has no cancel call; a reset interrupts decoding
        if !self.provider.reset_llm() {
            warn!("Reset during stop reported failure");
        }
    }

    fn release(&self) {
        self.provider.release_llm();
    }
}
