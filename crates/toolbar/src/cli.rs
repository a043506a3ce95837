//! Command-line interface handling for the toolbar.
//!
//! Each editor toolbar button maps to a subcommand. Global flags override the
//! matching settings from the configuration file.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

/// What the toolbar was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolbarCommand {
    /// Regenerate the schema from the type feed
    GenerateSchema,
    /// Write the launch configuration for the configured deployment
    LaunchConfig { output: Option<PathBuf> },
    /// Start the configured deployment and supervise it until interrupted
    Run { deployment: Option<String> },
    /// Print the header-level summary of a snapshot file
    InspectSnapshot { path: PathBuf },
}

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Optional override for the deployment scratch directory
    pub work_dir: Option<PathBuf>,
    pub command: ToolbarCommand,
}

fn command() -> Command {
    Command::new("toolbar")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Schema generation and deployment control for distributed simulations")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("toolbar.toml")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .global(true),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(clap::ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("work-dir")
                .short('w')
                .long("work-dir")
                .value_name("DIR")
                .help("Scratch directory for deployment files")
                .global(true),
        )
        .subcommand(Command::new("generate-schema").about("Generate the schema from the type feed"))
        .subcommand(
            Command::new("launch-config")
                .about("Write the launch configuration for the configured deployment")
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Output path (defaults to deployment.launch_config_path)"),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Start the deployment and stop it on Ctrl+C")
                .arg(
                    Arg::new("deployment")
                        .short('d')
                        .long("deployment")
                        .value_name("NAME")
                        .help("Deployment name (defaults to deployment.name)"),
                ),
        )
        .subcommand(
            Command::new("inspect-snapshot")
                .about("Show the header of a snapshot file")
                .arg(Arg::new("path").value_name("PATH").required(true)),
        )
}

impl CliArgs {
    /// Parses the process arguments. Exits with usage on invalid input.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        let command = match matches.subcommand() {
            Some(("generate-schema", _)) => ToolbarCommand::GenerateSchema,
            Some(("launch-config", sub)) => ToolbarCommand::LaunchConfig {
                output: sub.get_one::<String>("output").map(PathBuf::from),
            },
            Some(("inspect-snapshot", sub)) => ToolbarCommand::InspectSnapshot {
                path: sub.get_one::<String>("path").map(PathBuf::from).unwrap_or_default(),
            },
            Some(("run", sub)) => ToolbarCommand::Run {
                deployment: sub.get_one::<String>("deployment").cloned(),
            },
            _ => ToolbarCommand::Run { deployment: None },
        };

        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("toolbar.toml")),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            work_dir: matches.get_one::<String>("work-dir").map(PathBuf::from),
            command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_run() {
        let args = CliArgs::try_parse_from(["toolbar"]).unwrap();
        assert_eq!(args.config_path, PathBuf::from("toolbar.toml"));
        assert_eq!(args.command, ToolbarCommand::Run { deployment: None });
        assert!(!args.json_logs);
    }

    #[test]
    fn test_subcommands_and_global_flags() {
        let args = CliArgs::try_parse_from([
            "toolbar",
            "inspect-snapshot",
            "world.snapshot",
            "--log-level",
            "debug",
            "--json-logs",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            ToolbarCommand::InspectSnapshot {
                path: PathBuf::from("world.snapshot")
            }
        );
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);

        let args = CliArgs::try_parse_from(["toolbar", "-c", "alt.toml", "run", "-d", "local2"]).unwrap();
        assert_eq!(args.config_path, PathBuf::from("alt.toml"));
        assert_eq!(
            args.command,
            ToolbarCommand::Run {
                deployment: Some("local2".to_string())
            }
        );
    }

    #[test]
    fn test_inspect_requires_path() {
        assert!(CliArgs::try_parse_from(["toolbar", "inspect-snapshot"]).is_err());
    }
}
