//! Scripted native runtimes for exercising the engine without hardware

#![allow(dead_code)]

use breeze_engine::config::EngineConfig;
use breeze_engine::runtime::{AcceleratorProvider, CpuProvider};
use breeze_engine::{BackendKind, LlmEngineService};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const EOT: &str = "<|eot_id|>";

pub fn tokens(pieces: &[&str]) -> Vec<String> {
    pieces.iter().map(|p| p.to_string()).collect()
}

/// Vendor NPU runtime stand-in
pub struct FakeAccelerator {
    pub available: bool,
    /// Upcoming init calls that will fail
    pub init_failures: AtomicU32,
    pub init_delay: Duration,
    pub release_delay: Duration,
    pub tokens: Vec<String>,
    pub token_delay: Duration,
    pub init_calls: AtomicUsize,
    pub reset_calls: AtomicUsize,
    pub release_calls: AtomicUsize,
    pub swap_calls: AtomicUsize,
    /// Native calls in the order they happened
    pub calls: Mutex<Vec<&'static str>>,
    /// Set by a reset; ends the current generation early
    pub interrupted: AtomicBool,
}

impl Default for FakeAccelerator {
    fn default() -> Self {
        Self {
            available: true,
            init_failures: AtomicU32::new(0),
            init_delay: Duration::ZERO,
            release_delay: Duration::ZERO,
            tokens: tokens(&["Hi", " there", EOT]),
            token_delay: Duration::ZERO,
            init_calls: AtomicUsize::new(0),
            reset_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            swap_calls: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            interrupted: AtomicBool::new(false),
        }
    }
}

impl FakeAccelerator {
    pub fn failing(times: u32) -> Self {
        Self {
            init_failures: AtomicU32::new(times),
            ..Default::default()
        }
    }

    pub fn inits(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.reset_calls.load(Ordering::SeqCst)
    }

    pub fn swaps(&self) -> usize {
        self.swap_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }

    fn emit(&self, on_token: &mut dyn FnMut(&str)) -> String {
        self.record("generate-start");
        self.interrupted.store(false, Ordering::SeqCst);
        let mut text = String::new();
        for token in &self.tokens {
            thread::sleep(self.token_delay);
            if self.interrupted.load(Ordering::SeqCst) {
                break;
            }
            on_token(token);
            text.push_str(token);
        }
        self.record("generate-end");
        text
    }
}

impl AcceleratorProvider for FakeAccelerator {
    fn is_available(&self) -> bool {
        self.available
    }

    fn init_llm(&self, _config_path: &Path, _preload_shared_weights: bool) -> bool {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.record("init");
        thread::sleep(self.init_delay);
        let failing = self
            .init_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        !failing
    }

    fn inference(&self, _prompt: &str, _max_tokens: usize, _parse_tokens: bool) -> String {
        self.emit(&mut |_: &str| {})
    }

    fn streaming_inference(
        &self,
        _prompt: &str,
        _max_tokens: usize,
        _parse_tokens: bool,
        on_token: &mut dyn FnMut(&str),
    ) -> String {
        self.emit(on_token)
    }

    fn release_llm(&self) {
        thread::sleep(self.release_delay);
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.record("release");
    }

    fn reset_llm(&self) -> bool {
        self.interrupted.store(true, Ordering::SeqCst);
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        self.record("reset");
        true
    }

    fn swap_model(&self, _token_budget: usize) -> bool {
        self.swap_calls.fetch_add(1, Ordering::SeqCst);
        self.record("swap");
        true
    }
}

/// Portable CPU runner stand-in
pub struct FakeCpu {
    pub load_status: i32,
    pub tokens: Vec<String>,
    pub token_delay: Duration,
    pub panic_on_generate: bool,
    /// How long a stop request blocks before it takes effect
    pub stop_delay: Duration,
    pub load_calls: AtomicUsize,
    pub reset_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub last_seq_len: AtomicUsize,
    /// Set by a stop; ends the current generation early
    pub interrupted: AtomicBool,
}

impl Default for FakeCpu {
    fn default() -> Self {
        Self {
            load_status: 0,
            tokens: tokens(&["Hel", "lo", EOT, "ignored"]),
            token_delay: Duration::ZERO,
            panic_on_generate: false,
            stop_delay: Duration::ZERO,
            load_calls: AtomicUsize::new(0),
            reset_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            last_seq_len: AtomicUsize::new(0),
            interrupted: AtomicBool::new(false),
        }
    }
}

impl FakeCpu {
    pub fn slow(pieces: &[&str], delay: Duration) -> Self {
        Self {
            tokens: tokens(pieces),
            token_delay: delay,
            ..Default::default()
        }
    }

    pub fn loads(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.reset_calls.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl CpuProvider for FakeCpu {
    fn load(&self, _model_path: &Path, _tokenizer_path: &Path, _temperature: f32) -> i32 {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.load_status
    }

    fn generate(
        &self,
        _prompt: &str,
        seq_len: usize,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<(), String> {
        self.last_seq_len.store(seq_len, Ordering::SeqCst);
        self.interrupted.store(false, Ordering::SeqCst);
        if self.panic_on_generate {
            panic!("runner crashed");
        }
        for token in &self.tokens {
            thread::sleep(self.token_delay);
            if self.interrupted.load(Ordering::SeqCst) {
                return Ok(());
            }
            on_token(token);
        }
        Ok(())
    }

    fn stop(&self) {
        thread::sleep(self.stop_delay);
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn reset_native(&self) {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Short timings so scenarios run in milliseconds
pub fn fast_config(preferred: BackendKind) -> EngineConfig {
    EngineConfig {
        model_path: PathBuf::from("/models/breeze-tiny.pte"),
        tokenizer_path: PathBuf::from("/models/tokenizer.bin"),
        preferred_backend: preferred,
        settle_delay_ms: 1,
        cleanup_pause_ms: 1,
        init_timeout_ms: 5_000,
        generation_timeout_ms: 5_000,
        native_op_timeout_ms: 2_000,
        shutdown_budget_ms: 2_000,
        ..Default::default()
    }
}

pub fn service(
    config: &EngineConfig,
    accelerator: Option<Arc<FakeAccelerator>>,
    cpu: Option<Arc<FakeCpu>>,
) -> LlmEngineService {
    let accelerator = accelerator.map(|a| a as Arc<dyn AcceleratorProvider>);
    let cpu = cpu.map(|c| c as Arc<dyn CpuProvider>);
    LlmEngineService::new(config.clone(), accelerator, cpu).expect("engine service")
}
