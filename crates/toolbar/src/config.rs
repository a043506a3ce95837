//! Configuration management for the toolbar.
//!
//! This module handles loading, validation, and conversion of the toolbar settings
//! from TOML files into the typed configuration of the library crates.

use deployment::{
    ControllerConfig, DeploymentConfig, LaunchStrategy, LocalLaunchConfig, SnapshotSource, WorkerSpec,
};
use platform_client::{PlatformConfig, RetryPolicy};
use schema_gen::{JsonTypeFeed, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Toolbar configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub project: ProjectSettings,
    #[serde(default)]
    pub snapshot: SnapshotSettings,
    #[serde(default)]
    pub deployment: DeploymentSettings,
    #[serde(default)]
    pub workers: WorkerSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub platform: PlatformSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Project layout. Relative paths are resolved against `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub root: String,
    /// JSON reflection export of the game's replicated types
    pub type_feed: String,
    /// Persisted id map; keeps ids stable across generations
    pub id_registry: String,
    pub schema_output_dir: String,
    pub work_dir: String,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            root: ".".to_string(),
            type_feed: "reflection/types.json".to_string(),
            id_registry: "schema/ids.json".to_string(),
            schema_output_dir: "schema/generated".to_string(),
            work_dir: "deployments".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    pub directory: String,
    /// Snapshot inside `directory` used to start deployments; empty world when unset
    pub file: Option<String>,
    pub fresh_world_version: u32,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            directory: "snapshots".to_string(),
            file: None,
            fresh_world_version: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentSettings {
    pub name: String,
    pub stop_on_exit: bool,
    pub generate_default_launch_config: bool,
    pub launch_config_path: String,
    pub workers: Vec<WorkerSpec>,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            name: "local1".to_string(),
            stop_on_exit: true,
            generate_default_launch_config: true,
            launch_config_path: "default_launch.json".to_string(),
            workers: vec![WorkerSpec::new("sim", 1, LaunchStrategy::Local)],
        }
    }
}

/// Local worker binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub default_binary: String,
    pub extra_args: Vec<String>,
    pub log_dir: String,
    pub binaries: BTreeMap<String, String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            default_binary: "worker".to_string(),
            extra_args: Vec::new(),
            log_dir: "logs".to_string(),
            binaries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub schema_generation_secs: u64,
    pub startup_secs: u64,
    pub shutdown_grace_secs: u64,
    pub poll_interval_ms: u64,
    pub health_interval_ms: u64,
    pub memory_warning_mb: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            schema_generation_secs: 60,
            startup_secs: 30,
            shutdown_grace_secs: 10,
            poll_interval_ms: 250,
            health_interval_ms: 2000,
            memory_warning_mb: 2048,
        }
    }
}

/// Remote platform used by `cloud` workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    pub enabled: bool,
    pub base_url: String,
    pub project: String,
    /// Environment variable holding the API token
    pub token_env: String,
    pub request_timeout_secs: u64,
    pub retry: RetrySettings,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://127.0.0.1:9876".to_string(),
            project: "default".to_string(),
            token_env: "PLATFORM_TOKEN".to_string(),
            request_timeout_secs: 30,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_retries: 5,
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    /// Optional file path for log output (None means stdout only)
    pub file_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            file_path: None,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the specified path
    /// and returns the default configuration.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Resolves a configured path against the project root.
    pub fn project_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.project.root).join(path)
        }
    }

    pub fn to_controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            work_dir: self.project_path(&self.project.work_dir),
            snapshot_dir: self.project_path(&self.snapshot.directory),
            fresh_world_version: self.snapshot.fresh_world_version,
            schema_timeout: Duration::from_secs(self.timeouts.schema_generation_secs),
            startup_timeout: Duration::from_secs(self.timeouts.startup_secs),
            shutdown_grace: Duration::from_secs(self.timeouts.shutdown_grace_secs),
            poll_interval: Duration::from_millis(self.timeouts.poll_interval_ms),
            health_interval: Duration::from_millis(self.timeouts.health_interval_ms),
            memory_warning_mb: self.timeouts.memory_warning_mb,
        }
    }

    pub fn to_local_launch_config(&self) -> LocalLaunchConfig {
        let binaries: HashMap<String, PathBuf> = self
            .workers
            .binaries
            .iter()
            .map(|(worker_type, binary)| (worker_type.clone(), self.project_path(binary)))
            .collect();
        LocalLaunchConfig {
            default_binary: self.project_path(&self.workers.default_binary),
            binaries,
            extra_args: self.workers.extra_args.clone(),
            log_dir: self.project_path(&self.workers.log_dir),
            ..LocalLaunchConfig::default()
        }
    }

    /// Platform client settings, `None` when the platform is disabled.
    ///
    /// The token is read from the environment variable named by `platform.token_env`.
    pub fn to_platform_config(&self) -> Result<Option<PlatformConfig>, String> {
        if !self.platform.enabled {
            return Ok(None);
        }
        let token = std::env::var(&self.platform.token_env)
            .map_err(|_| format!("Platform token variable {} is not set", self.platform.token_env))?;
        Ok(Some(PlatformConfig {
            base_url: self.platform.base_url.trim_end_matches('/').to_string(),
            project: self.platform.project.clone(),
            token,
            request_timeout: Duration::from_secs(self.platform.request_timeout_secs),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.platform.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.platform.retry.max_delay_ms),
                max_retries: self.platform.retry.max_retries,
            },
        }))
    }

    pub fn to_deployment_config(&self) -> DeploymentConfig {
        let snapshot = match &self.snapshot.file {
            Some(file) => SnapshotSource::Path(self.project_path(&self.snapshot.directory).join(file)),
            None => SnapshotSource::Fresh,
        };
        let mut config = DeploymentConfig::new(self.deployment.name.clone()).with_snapshot(snapshot);
        config.worker_specs = self.deployment.workers.clone();
        config
    }

    pub fn schema_generator(&self) -> Arc<SchemaGenerator> {
        let feed = JsonTypeFeed::new(self.project_path(&self.project.type_feed));
        Arc::new(SchemaGenerator::new(
            Arc::new(feed),
            self.project_path(&self.project.id_registry),
            self.project_path(&self.project.schema_output_dir),
        ))
    }

    pub fn launch_config_path(&self) -> PathBuf {
        self.project_path(&self.deployment.launch_config_path)
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        if self.project.work_dir.is_empty() {
            return Err("project.work_dir cannot be empty".to_string());
        }
        if self.snapshot.directory.is_empty() {
            return Err("snapshot.directory cannot be empty".to_string());
        }

        self.to_deployment_config()
            .validate()
            .map_err(|e| format!("Invalid deployment settings: {e}"))?;
        if let Some(spec) = self.deployment.workers.iter().find(|w| w.count == 0) {
            return Err(format!("Worker type '{}' must have a count above 0", spec.worker_type));
        }
        let needs_platform = self
            .deployment
            .workers
            .iter()
            .any(|w| w.strategy == LaunchStrategy::Cloud);
        if needs_platform && !self.platform.enabled {
            return Err("Cloud workers require platform.enabled = true".to_string());
        }

        if self.timeouts.startup_secs == 0 || self.timeouts.schema_generation_secs == 0 {
            return Err("Timeouts must be greater than 0".to_string());
        }
        if self.timeouts.poll_interval_ms == 0 || self.timeouts.health_interval_ms == 0 {
            return Err("Poll and health intervals must be greater than 0".to_string());
        }

        if self.platform.enabled {
            let url = &self.platform.base_url;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("Invalid platform base_url: {url}"));
            }
            if self.platform.retry.base_delay_ms > self.platform.retry.max_delay_ms {
                return Err("platform.retry.base_delay_ms must not exceed max_delay_ms".to_string());
            }
        }

        Ok(())
    }
}
