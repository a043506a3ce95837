//! # Deployment Toolbar
//!
//! Command surface behind the editor toolbar: generates the schema, writes launch
//! configurations, inspects snapshots and runs a deployment until interrupted.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start the configured deployment (default command)
//! toolbar
//!
//! # Regenerate the schema from the reflection export
//! toolbar generate-schema
//!
//! # Run a named deployment with a custom config and JSON logs
//! toolbar --config playtest.toml --json-logs run --deployment playtest
//!
//! # Look inside a snapshot
//! toolbar inspect-snapshot snapshots/default.snapshot
//! ```
//!
//! ## Configuration
//!
//! Settings are read from a TOML file (default: `toolbar.toml`). If the file doesn't
//! exist, a default configuration is written.
//!
//! ## Signal Handling
//!
//! The first SIGINT/SIGTERM stops the running deployment gracefully; a second one
//! exits immediately.

use tracing::error;

mod app;
mod cli;
mod config;
mod logging;
mod signals;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Parses arguments, sets up logging and runs the requested command.
///
/// # Exit Codes
///
/// * **0**: Command completed
/// * **1**: Error during startup, configuration, or runtime
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Logging settings are needed before the full config is validated
    let mut config = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default();
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {e}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e}");
            std::process::exit(1);
        }
    }

    Ok(())
}

pub use cli::ToolbarCommand;
pub use config::{
    DeploymentSettings, LoggingSettings, PlatformSettings, ProjectSettings, RetrySettings, SnapshotSettings,
    TimeoutSettings, WorkerSettings,
};
