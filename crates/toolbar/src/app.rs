//! Main application logic and lifecycle management.
//!
//! The `Application` loads the configuration, applies CLI overrides and runs the
//! requested command. `run` starts the configured deployment, reports its health
//! periodically and stops it on the first termination signal.

use crate::cli::{CliArgs, ToolbarCommand};
use crate::config::AppConfig;
use crate::logging::display_banner;
use crate::signals::{setup_signal_handlers, setup_signal_handlers_silent};
use deployment::{CloudLauncher, DeploymentState, LaunchConfigFile, Orchestrator, SnapshotManager, WorkerLauncher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// How often the running deployment's health is reported.
const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(30);

pub struct Application {
    config: AppConfig,
    config_path: PathBuf,
    command: ToolbarCommand,
}

impl Application {
    /// Loads configuration, applies command-line overrides and validates the result.
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }
        if let Some(work_dir) = args.work_dir {
            config.project.work_dir = work_dir.to_string_lossy().to_string();
        }
        if let ToolbarCommand::Run {
            deployment: Some(name),
        } = &args.command
        {
            config.deployment.name = name.clone();
        }

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        display_banner();

        Ok(Self {
            config,
            config_path: args.config_path,
            command: args.command,
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        match self.command.clone() {
            ToolbarCommand::GenerateSchema => self.generate_schema().await,
            ToolbarCommand::LaunchConfig { output } => self.write_launch_config(output),
            ToolbarCommand::InspectSnapshot { path } => self.inspect_snapshot(&path).await,
            ToolbarCommand::Run { .. } => self.run_deployment().await,
        }
    }

    async fn generate_schema(&self) -> Result<(), Box<dyn std::error::Error>> {
        let generator = self.config.schema_generator();
        info!(
            "📐 Generating schema from {}",
            self.config.project_path(&self.config.project.type_feed).display()
        );

        let generation = tokio::task::spawn_blocking(move || generator.generate()).await??;
        info!(
            "✅ Schema {} generated: {} types ({} new, {} retired)",
            generation.artifact.short_hash(),
            generation.artifact.type_descriptors.len(),
            generation.new_types.len(),
            generation.retired_types.len()
        );
        for name in &generation.new_types {
            info!("  ➕ {}", name);
        }
        for name in &generation.retired_types {
            warn!("  🗄️ {} retired, its id stays reserved", name);
        }
        info!(
            "📂 Output: {}",
            self.config.project_path(&self.config.project.schema_output_dir).display()
        );
        Ok(())
    }

    fn write_launch_config(&self, output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
        let path = output.unwrap_or_else(|| self.config.launch_config_path());
        let file = LaunchConfigFile::from_deployment(
            &self.config.to_deployment_config(),
            self.config.snapshot.fresh_world_version,
        );
        file.write(&path)?;
        info!("📝 Launch configuration written to {}", path.display());
        Ok(())
    }

    async fn inspect_snapshot(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let manager = SnapshotManager::new(
            self.config.project_path(&self.config.snapshot.directory),
            self.config.snapshot.fresh_world_version,
        );
        let summary = manager.inspect(path).await?;
        info!("💾 Snapshot {}", summary.path.display());
        info!("  - Size: {} bytes", summary.bytes);
        info!("  - World version: {}", summary.world_version);
        info!("  - Entities: {}", summary.entity_count);
        for (type_id, count) in &summary.type_counts {
            info!("    type {:>6}: {}", type_id, count);
        }
        Ok(())
    }

    fn build_orchestrator(&self) -> Result<Orchestrator, Box<dyn std::error::Error>> {
        let controller_config = self.config.to_controller_config();
        let mut launcher = WorkerLauncher::new(
            self.config.to_local_launch_config(),
            controller_config.shutdown_grace,
        );
        if let Some(platform) = self.config.to_platform_config()? {
            let api = platform_client::connect(&platform)?;
            launcher = launcher.with_cloud(CloudLauncher::new(
                api,
                platform.project.clone(),
                controller_config.poll_interval,
            ));
            info!("☁️ Cloud launch enabled for project {}", platform.project);
        }
        Ok(Orchestrator::new(
            controller_config,
            launcher,
            Some(self.config.schema_generator()),
        ))
    }

    async fn run_deployment(self) -> Result<(), Box<dyn std::error::Error>> {
        let orchestrator = self.build_orchestrator()?;
        let name = self.config.deployment.name.clone();

        if self.config.deployment.generate_default_launch_config {
            self.write_launch_config(None)?;
        }
        self.log_configuration_summary();

        info!("🚀 Starting deployment '{}'", name);
        let ticket = orchestrator.start_deployment(&name, self.config.to_deployment_config())?;
        let mut state = ticket.state();

        let status = tokio::select! {
            result = ticket.wait() => match result {
                Ok(status) => status,
                Err(e) => {
                    error!("❌ Deployment '{}' failed to start: {}", name, e);
                    return Err(e.into());
                }
            },
            signal = setup_signal_handlers() => {
                signal?;
                warn!("🛑 Interrupted during startup, rolling back...");
                orchestrator.shutdown().await;
                return Ok(());
            }
        };

        info!(
            "✅ Deployment '{}' is running with {} workers",
            name,
            status.workers.len()
        );
        for worker in &status.workers {
            match worker.pid {
                Some(pid) => info!("  🔹 {} ({}, pid {})", worker.id, worker.worker_type, pid),
                None => info!("  🔹 {} ({}, remote)", worker.id, worker.worker_type),
            }
        }

        let monitoring_handle = {
            let controller = orchestrator.controller().clone();
            let name = name.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(STATUS_REPORT_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let status = controller.status(&name);
                    let peak_memory = status.workers.iter().filter_map(|w| w.memory_mb).max();
                    info!(
                        "📊 Deployment Health - {} | {}/{} workers alive | {:?} | peak {}MB",
                        status.state,
                        status.alive_workers(),
                        status.workers.len(),
                        status.health,
                        peak_memory.unwrap_or(0)
                    );
                }
            })
        };

        info!("🔍 Health reports every {}s", STATUS_REPORT_INTERVAL.as_secs());
        info!("🛑 Press Ctrl+C to stop the deployment");

        let failed = tokio::select! {
            signal = setup_signal_handlers() => {
                signal?;
                false
            }
            changed = state.wait_for(|s| *s == DeploymentState::Failed) => changed.is_ok(),
        };
        monitoring_handle.abort();

        if failed {
            let status = orchestrator.get_status(&name);
            let reason = status
                .last_error
                .map(|report| report.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            error!("❌ Deployment '{}' failed: {}", name, reason);
            return Err(format!("deployment '{name}' failed").into());
        }

        // A second signal skips the graceful stop.
        tokio::spawn(async move {
            if let Err(e) = setup_signal_handlers_silent().await {
                error!("Failed to set up merciless shutdown signal handler: {e}");
                return;
            }
            warn!("Shutdown handler received again! I'll make this quick.");
            std::process::exit(1);
        });

        if self.config.deployment.stop_on_exit {
            info!("🧹 Stopping deployment '{}'...", name);
            for (name, result) in orchestrator.shutdown().await {
                match result {
                    Ok(status) => info!("✅ Deployment '{}' {}", name, status.state),
                    Err(e) => error!("❌ Failed to stop deployment '{}': {}", name, e),
                }
            }
        } else {
            warn!("⚠️ stop_on_exit is disabled: cloud workers keep running, local workers exit with the toolbar");
        }

        info!("👋 Toolbar shutdown complete");
        Ok(())
    }

    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!("  📄 Config file: {}", self.config_path.display());
        info!("  📁 Project root: {}", self.config.project.root);
        info!("  🏷️ Deployment: {}", self.config.deployment.name);
        for spec in &self.config.deployment.workers {
            info!("  👷 {} x{} ({:?})", spec.worker_type, spec.count, spec.strategy);
        }
        match &self.config.snapshot.file {
            Some(file) => info!("  💾 Snapshot: {}/{}", self.config.snapshot.directory, file),
            None => info!("  💾 Snapshot: fresh world v{}", self.config.snapshot.fresh_world_version),
        }
        info!(
            "  ⏱️ Startup timeout: {}s | Shutdown grace: {}s",
            self.config.timeouts.startup_secs, self.config.timeouts.shutdown_grace_secs
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(config_path: PathBuf, command: ToolbarCommand) -> CliArgs {
        CliArgs {
            config_path,
            log_level: Some("debug".to_string()),
            json_logs: false,
            work_dir: Some(PathBuf::from("/tmp/toolbar-work")),
            command,
        }
    }

    #[tokio::test]
    async fn test_cli_overrides_apply() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::new(args(
            dir.path().join("toolbar.toml"),
            ToolbarCommand::Run {
                deployment: Some("local7".to_string()),
            },
        ))
        .await
        .unwrap();

        assert_eq!(app.config.logging.level, "debug");
        assert_eq!(app.config.project.work_dir, "/tmp/toolbar-work");
        assert_eq!(app.config.deployment.name, "local7");
    }

    #[tokio::test]
    async fn test_invalid_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = args(dir.path().join("toolbar.toml"), ToolbarCommand::GenerateSchema);
        cli.log_level = Some("chatty".to_string());
        assert!(Application::new(cli).await.is_err());
    }

    #[tokio::test]
    async fn test_launch_config_command() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("launch.json");
        let app = Application::new(args(
            dir.path().join("toolbar.toml"),
            ToolbarCommand::LaunchConfig {
                output: Some(output.clone()),
            },
        ))
        .await
        .unwrap();
        app.run().await.unwrap();

        let file = LaunchConfigFile::load(&output).unwrap();
        assert_eq!(file.world.name, "local1");
        assert_eq!(file.workers.len(), 1);
    }

    #[tokio::test]
    async fn test_generate_schema_command() {
        let dir = tempfile::tempdir().unwrap();
        let feed = dir.path().join("types.json");
        std::fs::write(
            &feed,
            r#"{"types":[{"qualified_name":"/Script/Game.Door","fields":[{"name":"Open","wire_type":"bool"}]}]}"#,
        )
        .unwrap();

        let config_path = dir.path().join("toolbar.toml");
        let mut config = AppConfig::default();
        config.project.root = dir.path().to_string_lossy().to_string();
        config.project.type_feed = "types.json".to_string();
        std::fs::write(&config_path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let app = Application::new(args(config_path, ToolbarCommand::GenerateSchema))
            .await
            .unwrap();
        app.run().await.unwrap();

        assert!(dir.path().join("schema/ids.json").exists());
        assert!(dir.path().join("schema/generated").join(schema_gen::MANIFEST_FILE).exists());
    }
}
