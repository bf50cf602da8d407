//! Configuration file management for corral.
//!
//! Provides a TOML config file at `~/.config/corral/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use corral_core::build::BinaryNames;
use corral_core::logs::FollowerCommand;
use corral_core::spawn::SpawnOptions;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub log_dir: Option<PathBuf>,
    pub project_dir: Option<PathBuf>,
    pub env_tool: Option<String>,
    pub env_tool_args: Vec<String>,
    pub env_prefix: Option<String>,
    pub interface: Option<String>,
    pub settle_secs: Option<u64>,
    pub kill_grace_secs: Option<u64>,
    pub workload_value: Option<String>,
    pub binaries: BinaryNames,
    pub services: OutputSection,
    pub accelerators: OutputSection,
    pub network: NetworkSection,
    pub follower: FollowerSection,
}

/// Output routing for a class of background processes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSection {
    pub log: Option<bool>,
    pub tail: Option<bool>,
}

impl OutputSection {
    fn resolve(self, default: SpawnOptions) -> SpawnOptions {
        SpawnOptions {
            logging: self.log.unwrap_or(default.logging),
            tail: self.tail.unwrap_or(default.tail),
        }
    }
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSection {
    /// Shell commands run in each environment after setup.
    pub toggles: Vec<String>,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FollowerSection {
    /// Program and arguments; `{path}` is replaced with the log path.
    pub command: Option<Vec<String>>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the corral config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/corral` or `~/.config/corral`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("corral");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("corral")
}

/// Return the path to the default corral config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read
// -----------------------------------------------------------------------

/// Parse the config file at `path`.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Load the explicitly requested config file, or the default one if it
/// exists.
pub fn load_for(explicit: Option<&Path>) -> Result<Option<ConfigFile>> {
    match explicit {
        Some(path) => load_config(path).map(Some),
        None => {
            let path = config_path();
            if path.exists() {
                load_config(&path).map(Some)
            } else {
                Ok(None)
            }
        }
    }
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_ENV_TOOL: &str = "netns-env";
pub const DEFAULT_ENV_PREFIX: &str = "node";
pub const DEFAULT_INTERFACE: &str = "veth0";
pub const DEFAULT_SETTLE_SECS: u64 = 2;
pub const DEFAULT_KILL_GRACE_SECS: u64 = 5;
pub const DEFAULT_WORKLOAD_VALUE: &str = "42";

/// Settings the CLI may override directly.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub log_dir: Option<PathBuf>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub log_dir: PathBuf,
    pub project_dir: PathBuf,
    pub env_tool: String,
    pub env_tool_args: Vec<String>,
    pub env_prefix: String,
    pub interface: String,
    pub settle: Duration,
    pub kill_grace: Duration,
    pub workload_value: String,
    pub binaries: BinaryNames,
    pub services: SpawnOptions,
    pub accelerators: SpawnOptions,
    pub network_toggles: Vec<String>,
    pub follower: FollowerCommand,
}

impl HarnessConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default, reading `CORRAL_*` variables from the process
    /// environment.
    pub fn resolve(cli: &CliOverrides, file: Option<ConfigFile>) -> Result<Self> {
        Self::resolve_with(cli, file, |key| std::env::var(key).ok())
    }

    /// [`resolve`](Self::resolve) with an explicit environment lookup.
    pub fn resolve_with(
        cli: &CliOverrides,
        file: Option<ConfigFile>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = file.unwrap_or_default();
        let env = |key: &str| env(key).filter(|v| !v.is_empty());
        let secs = |key: &str| -> Result<Option<u64>> {
            env(key)
                .map(|v| {
                    v.parse::<u64>()
                        .with_context(|| format!("{key} must be a whole number of seconds, got {v:?}"))
                })
                .transpose()
        };

        let log_dir = cli
            .log_dir
            .clone()
            .or_else(|| env("CORRAL_LOG_DIR").map(PathBuf::from))
            .or(file.log_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));

        let project_dir = env("CORRAL_PROJECT_DIR")
            .map(PathBuf::from)
            .or(file.project_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        let settle_secs = secs("CORRAL_SETTLE_SECS")?
            .or(file.settle_secs)
            .unwrap_or(DEFAULT_SETTLE_SECS);
        let kill_grace_secs = secs("CORRAL_KILL_GRACE_SECS")?
            .or(file.kill_grace_secs)
            .unwrap_or(DEFAULT_KILL_GRACE_SECS);

        let follower = match file.follower.command {
            Some(command) => follower_from(command)?,
            None => FollowerCommand::default(),
        };

        Ok(Self {
            log_dir,
            project_dir,
            env_tool: env("CORRAL_ENV_TOOL")
                .or(file.env_tool)
                .unwrap_or_else(|| DEFAULT_ENV_TOOL.to_string()),
            env_tool_args: file.env_tool_args,
            env_prefix: env("CORRAL_ENV_PREFIX")
                .or(file.env_prefix)
                .unwrap_or_else(|| DEFAULT_ENV_PREFIX.to_string()),
            interface: env("CORRAL_INTERFACE")
                .or(file.interface)
                .unwrap_or_else(|| DEFAULT_INTERFACE.to_string()),
            settle: Duration::from_secs(settle_secs),
            kill_grace: Duration::from_secs(kill_grace_secs),
            workload_value: env("CORRAL_WORKLOAD_VALUE")
                .or(file.workload_value)
                .unwrap_or_else(|| DEFAULT_WORKLOAD_VALUE.to_string()),
            binaries: file.binaries,
            services: file.services.resolve(SpawnOptions::default()),
            accelerators: file.accelerators.resolve(SpawnOptions::logged()),
            network_toggles: file.network.toggles,
            follower,
        })
    }
}

fn follower_from(command: Vec<String>) -> Result<FollowerCommand> {
    let mut parts = command.into_iter();
    let Some(program) = parts.next() else {
        bail!("follower.command must name a program");
    };
    let args: Vec<String> = parts.collect();
    if !args.iter().any(|a| a.contains(FollowerCommand::PATH_PLACEHOLDER)) {
        bail!(
            "follower.command must reference the log path as {}",
            FollowerCommand::PATH_PLACEHOLDER
        );
    }
    Ok(FollowerCommand { program, args })
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
