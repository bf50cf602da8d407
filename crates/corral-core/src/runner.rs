//! Bound runner: run one command to completion with the same logging and
//! streaming as the spawner.
//!
//! Each invocation appends a segment to the log for its name, opened with a
//! header line, so repeated operations under one name (e.g. every client
//! call under `"client"`) read back as an ordered transcript.

use std::process::ExitStatus;

use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::command::CommandSpec;
use crate::logs::{LogError, LogMux};
use crate::registry::ProcessRegistry;
use crate::spawn::{ProcessError, launch};

/// Prefix of the header line written at the start of every segment.
pub const SEGMENT_MARKER: &str = "==>";

/// Errors from [`BoundRunner::run_checked`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The command ran but exited unsuccessfully.
    #[error("{name:?} failed ({}): `{command}`", describe_status(.status))]
    Failed {
        name: String,
        command: String,
        status: ExitStatus,
    },
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit {code}"),
        None => "killed by signal".to_string(),
    }
}

/// Options for [`BoundRunner::run_and_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Stream the log for this name to the operator.
    pub tail: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { tail: true }
    }
}

/// Runs commands synchronously from the caller's point of view.
#[derive(Debug, Clone, Copy)]
pub struct BoundRunner<'a> {
    logs: &'a LogMux,
    registry: &'a ProcessRegistry,
}

impl<'a> BoundRunner<'a> {
    pub fn new(logs: &'a LogMux, registry: &'a ProcessRegistry) -> Self {
        Self { logs, registry }
    }

    /// Run `command` under `name`, appending its output to the log for
    /// `name`, and return its exit status once it terminates.
    ///
    /// Only the command itself is awaited; a follower started for the log
    /// keeps running for later invocations.
    pub async fn run_and_wait(
        &self,
        name: &str,
        command: &CommandSpec,
        options: RunOptions,
    ) -> Result<ExitStatus, ProcessError> {
        let mut stream = self.logs.open_log(name)?;
        let path = stream.path().to_path_buf();
        let open_err = |source| LogError::Open {
            path: path.clone(),
            source,
        };

        let header = format!(
            "{SEGMENT_MARKER} [{}] $ {command}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        stream.append_line(&header).map_err(open_err)?;

        if options.tail {
            self.logs.ensure_follower(stream.path(), self.registry).await?;
        }

        let (stdout, stderr) = stream.stdio().map_err(open_err)?;
        let mut cmd = command.to_command();
        cmd.stdout(stdout).stderr(stderr);

        let handle = launch(self.registry, name, command, cmd)?;
        info!(name, pid = handle.pid, command = %command, "running");

        let status = self
            .registry
            .wait(&handle)
            .await
            .map_err(|source| ProcessError::Wait {
                name: name.to_string(),
                source,
            })?;

        if status.success() {
            info!(name, pid = handle.pid, "finished");
        } else {
            warn!(name, pid = handle.pid, status = %status, "exited unsuccessfully");
        }
        Ok(status)
    }

    /// Like [`run_and_wait`](Self::run_and_wait), but an unsuccessful exit is
    /// an error.
    pub async fn run_checked(
        &self,
        name: &str,
        command: &CommandSpec,
        options: RunOptions,
    ) -> Result<(), RunError> {
        let status = self.run_and_wait(name, command, options).await?;
        if status.success() {
            Ok(())
        } else {
            Err(RunError::Failed {
                name: name.to_string(),
                command: command.to_string(),
                status,
            })
        }
    }
}

/// Split a log written by the runner into its segments, header included.
pub fn segments(log: &str) -> Vec<&str> {
    let mut starts: Vec<usize> = log
        .match_indices(SEGMENT_MARKER)
        .filter(|(idx, _)| *idx == 0 || log.as_bytes()[idx - 1] == b'\n')
        .map(|(idx, _)| idx)
        .collect();
    starts.push(log.len());
    starts.windows(2).map(|w| &log[w[0]..w[1]]).collect()
}
