//! Shared constants for the engine
//!
//! Centralizes sentinel strings, timing and sizing defaults so the
//! selector, sessions and coordinator agree on them.

/// Strings surfaced to callers in place of generated text
pub mod responses {
    /// Returned when generation cannot produce any text
    pub const LLM_ERROR_RESPONSE: &str = "[Error: Unable to generate response]";

    /// Result of a session stopped before any token arrived
    pub const STOPPED_PLACEHOLDER: &str = "[Generation stopped by user]";

    /// Advisory pushed to the token sink once the generation timeout elapses
    pub const SLOW_GENERATION_NOTICE: &str =
        "\n[Note: Generation is taking longer than usual but will continue...]";
}

/// End-of-generation markers emitted by the native runtimes
pub mod tokens {
    /// Llama 3.2 end-of-turn marker
    pub const EOT: &str = "<|eot_id|>";

    /// Llama 3.2 end-of-text marker
    pub const END_OF_TEXT: &str = "<|end_of_text|>";

    pub const DEFAULT_STOP_TOKENS: &[&str] = &[EOT, END_OF_TEXT];
}

/// Timing defaults, in milliseconds
pub mod timing {
    pub const INIT_TIMEOUT_MS: u64 = 120_000;
    pub const GENERATION_TIMEOUT_MS: u64 = 60_000;
    pub const NATIVE_OP_TIMEOUT_MS: u64 = 5_000;
    pub const SHUTDOWN_BUDGET_MS: u64 = 10_000;

    /// Pause before an accelerator init; the vendor signal chain needs it
    pub const SETTLE_DELAY_MS: u64 = 200;

    /// Pause between native reset and release during cleanup
    pub const CLEANUP_PAUSE_MS: u64 = 100;

    /// Rounds of {reset, pause, release} in a forced cleanup
    pub const FORCED_CLEANUP_ROUNDS: usize = 3;
}

/// Sizing defaults
pub mod limits {
    pub const MAX_RESPONSE_TOKENS: usize = 256;

    /// Token budget handed to the accelerator's model swap after each generation
    pub const SWAP_TOKEN_BUDGET: usize = 128;

    pub const MAX_ACCELERATOR_INIT_ATTEMPTS: u32 = 3;
    pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

    /// Capacity of the token channel behind `generate_stream`
    pub const TOKEN_CHANNEL_CAPACITY: usize = 256;
}
