//! Command spawner: start a command in the background, route its output, and
//! hand it to the process registry.

use std::io;
use std::process::Stdio;

use thiserror::Error;
use tracing::info;

use crate::command::CommandSpec;
use crate::logs::{LogError, LogMux};
use crate::registry::{ProcessHandle, ProcessRegistry, Role};

/// Errors raised while launching or waiting on a supervised command.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Log(#[from] LogError),

    /// The command could not be started (e.g. executable not found).
    #[error("failed to launch `{command}` as {name:?}: {source}")]
    Launch {
        name: String,
        command: String,
        #[source]
        source: io::Error,
    },

    /// Waiting for the command to exit failed.
    #[error("failed to wait for {name:?}: {source}")]
    Wait {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Output routing for [`Spawner::spawn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Route combined output into the log for the name. When `false` the
    /// output is discarded and no log file is touched.
    pub logging: bool,
    /// Stream the log to the operator. Ignored when `logging` is `false`.
    pub tail: bool,
}

impl SpawnOptions {
    /// Discard output entirely.
    pub const fn silent() -> Self {
        Self {
            logging: false,
            tail: false,
        }
    }

    /// Log to file without streaming.
    pub const fn logged() -> Self {
        Self {
            logging: true,
            tail: false,
        }
    }
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            logging: true,
            tail: true,
        }
    }
}

/// Launches background commands for a run.
#[derive(Debug, Clone, Copy)]
pub struct Spawner<'a> {
    logs: &'a LogMux,
    registry: &'a ProcessRegistry,
}

impl<'a> Spawner<'a> {
    pub fn new(logs: &'a LogMux, registry: &'a ProcessRegistry) -> Self {
        Self { logs, registry }
    }

    /// Start `command` under `name` and return without waiting for it.
    ///
    /// Registers the command's handle, and the follower's handle when one is
    /// newly started.
    pub async fn spawn(
        &self,
        name: &str,
        command: &CommandSpec,
        options: SpawnOptions,
    ) -> Result<ProcessHandle, ProcessError> {
        let mut cmd = command.to_command();

        if options.logging {
            let stream = self.logs.open_log(name)?;
            if options.tail {
                self.logs.ensure_follower(stream.path(), self.registry).await?;
            }
            let (stdout, stderr) = stream.stdio().map_err(|source| LogError::Open {
                path: stream.path().to_path_buf(),
                source,
            })?;
            cmd.stdout(stdout).stderr(stderr);
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let handle = launch(self.registry, name, command, cmd)?;
        info!(name, pid = handle.pid, command = %command, "spawned");
        Ok(handle)
    }
}

/// Spawn a prepared command and register it as a producer.
pub(crate) fn launch(
    registry: &ProcessRegistry,
    name: &str,
    spec: &CommandSpec,
    mut cmd: tokio::process::Command,
) -> Result<ProcessHandle, ProcessError> {
    let launch_err = |source| ProcessError::Launch {
        name: name.to_string(),
        command: spec.to_string(),
        source,
    };
    let child = cmd.spawn().map_err(launch_err)?;
    let pid = child
        .id()
        .ok_or_else(|| launch_err(io::Error::other("process exited before it was tracked")))?;
    Ok(registry.register(name, Role::Producer, pid, child))
}
