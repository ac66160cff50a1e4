//! CPU backend over the portable runner

use std::sync::Arc;
use tracing::{debug, info};

use super::handle::NativeBackend;
use super::provider::CpuProvider;
use super::BackendKind;
use crate::config::EngineConfig;
use crate::error::{InferError, InitError};

/// Sequence length hint for the CPU runner: roughly 0.75 tokens per
/// character of prompt, plus headroom for the reply preamble.
///
/// Length is measured in UTF-16 code units, the unit the runner's
/// tokenizer budget was tuned against, so a character outside the BMP
/// counts twice.
pub fn seq_len_hint(prompt: &str) -> usize {
    let units = prompt.encode_utf16().count();
    (units as f64 * 0.75).floor() as usize + 64
}

pub struct CpuBackend {
    provider: Arc<dyn CpuProvider>,
    stop_tokens: Vec<String>,
}

impl CpuBackend {
    pub fn new(provider: Arc<dyn CpuProvider>, stop_tokens: Vec<String>) -> Self {
        Self {
            provider,
            stop_tokens,
        }
    }

    fn is_stop_token(&self, token: &str) -> bool {
        self.stop_tokens.iter().any(|t| t == token)
    }

    /// Drive the runner, forwarding every piece to `sink` and collecting
    /// the text up to the first stop token.
    fn run(&self, prompt: &str, sink: &mut dyn FnMut(&str)) -> Result<String, InferError> {
        let seq_len = seq_len_hint(prompt);
        debug!(seq_len, "Starting CPU generation");

        let mut text = String::new();
        let mut finished = false;
        let mut collect = |token: &str| {
            sink(token);
            if finished {
                return;
            }
            if self.is_stop_token(token) {
                finished = true;
            } else {
                text.push_str(token);
            }
        };

        self.provider
            .generate(prompt, seq_len, &mut collect)
            .map_err(InferError::NativeFault)?;
        Ok(text)
    }
}

impl NativeBackend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn init(&self, config: &EngineConfig) -> Result<(), InitError> {
        if config.model_path.as_os_str().is_empty() {
            return Err(InitError::ModelLoadFailed(
                "no model path configured for CPU backend".to_string(),
            ));
        }

        info!("Loading CPU model from {:?}", config.model_path);
        let status = self.provider.load(
            &config.model_path,
            &config.tokenizer_path,
            config.temperature,
        );
        if status != 0 {
            return Err(InitError::ModelLoadFailed(format!(
                "CPU runner load returned status {}",
                status
            )));
        }
        Ok(())
    }

    fn infer(&self, prompt: &str, _max_tokens: usize) -> Result<String, InferError> {
        // The runner bounds output by sequence length, not token count
        self.run(prompt, &mut |_: &str| {})
    }

    fn infer_streaming(
        &self,
        prompt: &str,
        _max_tokens: usize,
        sink: &mut dyn FnMut(&str),
    ) -> Result<String, InferError> {
        self.run(prompt, sink)
    }

    fn reset(&self) -> Result<(), InferError> {
        self.provider.reset_native();
        Ok(())
    }

    fn stop(&self) {
        self.provider.stop();
    }

    fn release(&self) {
        self.provider.reset_native();
    }
}
