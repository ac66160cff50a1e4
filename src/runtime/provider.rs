//! Entry points of the two native runtimes
//!
//! These traits mirror the foreign calls one-to-one. Implementations are
//! expected to be thin bindings; all policy (retries, cleanup, timeouts)
//! lives above them. A panic inside any call is treated as a native fault.

use std::path::Path;

/// Portable CPU runner
pub trait CpuProvider: Send + Sync {
    /// Load weights and tokenizer. Returns the runner's status code, 0 on success.
    fn load(&self, model_path: &Path, tokenizer_path: &Path, temperature: f32) -> i32;

    /// Run generation, delivering each decoded piece to `on_token`.
    ///
    /// `seq_len` is an upper bound on the total sequence length.
    fn generate(
        &self,
        prompt: &str,
        seq_len: usize,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<(), String>;

    /// Ask an in-flight generation to stop early
    fn stop(&self);

    /// Drop native state (model, KV cache)
    fn reset_native(&self);
}

/// Vendor NPU runtime
///
/// The vendor library keeps a single process-wide model, so these calls
/// act on global native state rather than on a particular instance.
pub trait AcceleratorProvider: Send + Sync {
    /// Whether the vendor library could be loaded at all
    fn is_available(&self) -> bool {
        true
    }

    fn init_llm(&self, config_path: &Path, preload_shared_weights: bool) -> bool;

    fn inference(&self, prompt: &str, max_tokens: usize, parse_tokens: bool) -> String;

    fn streaming_inference(
        &self,
        prompt: &str,
        max_tokens: usize,
        parse_tokens: bool,
        on_token: &mut dyn FnMut(&str),
    ) -> String;

    fn release_llm(&self);

    fn reset_llm(&self) -> bool;

    /// Rebuild the model for a new token budget
    fn swap_model(&self, token_budget: usize) -> bool;
}
