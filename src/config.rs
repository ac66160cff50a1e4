//! Configuration management for the Breeze engine.
//!
//! Settings are assembled from several sources, later ones overriding
//! earlier ones:
//! 1. Default configuration (embedded in binary)
//! 2. User-specified configuration file
//! 3. Environment variables (prefixed with `BREEZE__`, nested keys joined by `__`)
//! 4. Command-line arguments
//!
//! # Environment Variables
//!
//! - `BREEZE__ENGINE__MODEL_PATH` - CPU model weights
//! - `BREEZE__ENGINE__PREFERRED_BACKEND` - `accelerator` or `cpu`
//! - `BREEZE__ENGINE__FALLBACK_TO_CPU` - fall back after accelerator failure
//! - `BREEZE__LOGGING__LEVEL` - default log level

use clap::{Parser, Subcommand};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{limits, timing, tokens};
use crate::error::{EngineError, Result};
use crate::runtime::BackendKind;

/// Command-line arguments
#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct Args {
    /// Configuration file path
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Model weights for the CPU backend
    #[clap(long)]
    pub model_path: Option<PathBuf>,

    /// Preferred backend (accelerator, cpu)
    #[clap(long)]
    pub preferred_backend: Option<BackendKind>,

    /// Log level when RUST_LOG is unset
    #[clap(long)]
    pub log_level: Option<String>,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum Command {
    /// Print the resolved settings as JSON
    ShowConfig,
    /// Load and validate the settings
    Validate,
}

/// Root settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-initialization request handed to the lifecycle coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model weights for the CPU runtime
    pub model_path: PathBuf,
    /// Tokenizer for the CPU runtime
    pub tokenizer_path: PathBuf,
    /// Vendor runtime YAML handed to the accelerator init call
    pub accelerator_config_path: PathBuf,
    /// Preload shared weights during accelerator init
    pub preload_shared_weights: bool,
    pub preferred_backend: BackendKind,
    /// Try the CPU backend once the accelerator is exhausted
    pub fallback_to_cpu: bool,
    /// Build-time switch for the accelerator path
    pub accelerator_enabled: bool,
    pub temperature: f32,
    pub max_response_tokens: usize,
    pub swap_token_budget: usize,
    pub stop_tokens: Vec<String>,
    pub init_timeout_ms: u64,
    pub generation_timeout_ms: u64,
    pub native_op_timeout_ms: u64,
    pub shutdown_budget_ms: u64,
    pub settle_delay_ms: u64,
    pub cleanup_pause_ms: u64,
    pub max_accelerator_init_attempts: u32,
    pub max_consecutive_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            tokenizer_path: PathBuf::new(),
            accelerator_config_path: PathBuf::new(),
            preload_shared_weights: true,
            preferred_backend: BackendKind::Accelerator,
            fallback_to_cpu: true,
            accelerator_enabled: true,
            temperature: 0.8,
            max_response_tokens: limits::MAX_RESPONSE_TOKENS,
            swap_token_budget: limits::SWAP_TOKEN_BUDGET,
            stop_tokens: tokens::DEFAULT_STOP_TOKENS
                .iter()
                .map(|t| t.to_string())
                .collect(),
            init_timeout_ms: timing::INIT_TIMEOUT_MS,
            generation_timeout_ms: timing::GENERATION_TIMEOUT_MS,
            native_op_timeout_ms: timing::NATIVE_OP_TIMEOUT_MS,
            shutdown_budget_ms: timing::SHUTDOWN_BUDGET_MS,
            settle_delay_ms: timing::SETTLE_DELAY_MS,
            cleanup_pause_ms: timing::CLEANUP_PAUSE_MS,
            max_accelerator_init_attempts: limits::MAX_ACCELERATOR_INIT_ATTEMPTS,
            max_consecutive_failures: limits::MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl EngineConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    pub fn native_op_timeout(&self) -> Duration {
        Duration::from_millis(self.native_op_timeout_ms)
    }

    pub fn shutdown_budget(&self) -> Duration {
        Duration::from_millis(self.shutdown_budget_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn cleanup_pause(&self) -> Duration {
        Duration::from_millis(self.cleanup_pause_ms)
    }

    /// Whether `token` is one of the configured end-of-generation markers
    pub fn is_stop_token(&self, token: &str) -> bool {
        self.stop_tokens.iter().any(|t| t == token)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.preferred_backend == BackendKind::None {
            return Err(EngineError::Config(
                "preferred_backend must be accelerator or cpu".to_string(),
            ));
        }
        if self.max_accelerator_init_attempts == 0 || self.max_consecutive_failures == 0 {
            return Err(EngineError::Config(
                "accelerator attempt and failure limits must be at least 1".to_string(),
            ));
        }
        let timeouts = [
            ("init_timeout_ms", self.init_timeout_ms),
            ("generation_timeout_ms", self.generation_timeout_ms),
            ("native_op_timeout_ms", self.native_op_timeout_ms),
            ("shutdown_budget_ms", self.shutdown_budget_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(EngineError::Config(format!("{} must be non-zero", name)));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(EngineError::Config(format!(
                "temperature {} outside 0.0..=2.0",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when RUST_LOG is unset
    pub level: String,
    /// Directory for daily-rolling log files (None for stderr only)
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "breeze-engine".to_string(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = Config::builder().add_source(File::from_str(
            include_str!("../config/default.toml"),
            FileFormat::Toml,
        ));

        if let Some(path) = &args.config {
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(
            Environment::with_prefix("BREEZE")
                .separator("__")
                .try_parsing(true),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;

        if let Some(model_path) = &args.model_path {
            settings.engine.model_path = model_path.clone();
        }
        if let Some(backend) = args.preferred_backend {
            settings.engine.preferred_backend = backend;
        }
        if let Some(level) = &args.log_level {
            settings.logging.level = level.clone();
        }

        Ok(settings)
    }
}
