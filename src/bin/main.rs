//! Breeze engine binary.
//!
//! Resolves and checks engine settings the same way an embedding host
//! would load them.

use anyhow::{Context, Result};
use breeze_engine::config::{Args, Command, Settings};
use breeze_engine::telemetry;
use clap::Parser;
use tracing::{info, warn};

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(&args).context("Failed to load settings")?;
    let _guard = telemetry::init_tracing(&settings.logging)?;

    match args.command.unwrap_or(Command::ShowConfig) {
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Command::Validate => {
            settings
                .engine
                .validate()
                .context("Engine configuration is invalid")?;
            if settings.engine.model_path.as_os_str().is_empty() {
                warn!("No CPU model path configured; CPU fallback will fail");
            }
            info!(
                preferred = %settings.engine.preferred_backend,
                fallback = settings.engine.fallback_to_cpu,
                "Configuration is valid"
            );
            println!("ok");
        }
    }

    Ok(())
}
