//! Isolated network environments the cluster runs in.
//!
//! The harness never creates namespaces itself; it asks an
//! [`EnvironmentController`] for the commands that do, and for the commands
//! that run a program inside one. [`ToolController`] drives an external
//! command-line tool with `setup`, `exec`, and `status` subcommands.

use std::net::IpAddr;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::command::CommandSpec;

/// Errors raised while querying an environment.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("failed to run `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed ({status}): {stderr}")]
    Status {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("status for environment {env:?} is not valid JSON: {source}")]
    Malformed {
        env: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no address in environment status: {0}")]
    NoAddress(String),

    #[error("invalid address {value:?}: {source}")]
    BadAddress {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

/// Creates and enters isolated environments.
#[async_trait]
pub trait EnvironmentController: Send + Sync {
    /// Human-readable name of the backend.
    fn name(&self) -> &str;

    /// Command that creates `env`. Re-running it for an existing environment
    /// may fail; callers treat the step as best-effort.
    fn setup(&self, env: &str) -> CommandSpec;

    /// Wrap `command` so that it runs inside `env`.
    fn exec(&self, env: &str, command: &CommandSpec) -> CommandSpec;

    /// Metadata describing `env`; see [`parse_address`].
    async fn status(&self, env: &str) -> Result<Value, EnvError>;
}

/// Controller backed by an external tool:
/// `<tool> [base args] setup <env>`, `<tool> [base args] exec <env> -- <cmd>`,
/// and `<tool> [base args] status <env>` printing JSON.
#[derive(Debug, Clone)]
pub struct ToolController {
    tool: String,
    base_args: Vec<String>,
}

impl ToolController {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            base_args: Vec::new(),
        }
    }

    /// Arguments placed before every subcommand (e.g. a state directory).
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    fn subcommand(&self, sub: &str, env: &str) -> CommandSpec {
        CommandSpec::new(&self.tool)
            .args(self.base_args.iter().cloned())
            .arg(sub)
            .arg(env)
    }
}

#[async_trait]
impl EnvironmentController for ToolController {
    fn name(&self) -> &str {
        &self.tool
    }

    fn setup(&self, env: &str) -> CommandSpec {
        self.subcommand("setup", env)
    }

    fn exec(&self, env: &str, command: &CommandSpec) -> CommandSpec {
        let mut wrapped = self
            .subcommand("exec", env)
            .arg("--")
            .arg(command.program())
            .args(command.get_args().iter().cloned());
        for (key, value) in command.get_env() {
            wrapped = wrapped.env(key, value);
        }
        if let Some(dir) = command.get_current_dir() {
            wrapped = wrapped.current_dir(dir);
        }
        wrapped
    }

    async fn status(&self, env: &str) -> Result<Value, EnvError> {
        let spec = self.subcommand("status", env);
        let output = spec
            .to_command()
            .output()
            .await
            .map_err(|source| EnvError::Launch {
                command: spec.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(EnvError::Status {
                command: spec.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let status = serde_json::from_slice(&output.stdout).map_err(|source| EnvError::Malformed {
            env: env.to_string(),
            source,
        })?;
        debug!(env, %status, "environment status");
        Ok(status)
    }
}

const ADDRESS_KEYS: [&str; 3] = ["address", "ip", "addr"];

/// Extract the environment's IP address from its status metadata.
///
/// Looks for an `address`, `ip`, or `addr` string at the top level, then in
/// each element of an `interfaces` array. A `/prefix` suffix is ignored.
pub fn parse_address(status: &Value) -> Result<IpAddr, EnvError> {
    let direct = ADDRESS_KEYS
        .iter()
        .find_map(|key| status.get(key).and_then(Value::as_str));
    let nested = || {
        status
            .get("interfaces")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find_map(|iface| {
                ADDRESS_KEYS
                    .iter()
                    .find_map(|key| iface.get(key).and_then(Value::as_str))
            })
    };

    let raw = direct
        .or_else(nested)
        .ok_or_else(|| EnvError::NoAddress(status.to_string()))?;
    let bare = raw.split('/').next().unwrap_or(raw).trim();
    bare.parse().map_err(|source| EnvError::BadAddress {
        value: raw.to_string(),
        source,
    })
}
