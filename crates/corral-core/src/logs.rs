//! Log multiplexer: one append-only file per logical name, and at most one
//! live follower per file.
//!
//! Names are truncated on their first use within a run and appended to on
//! every later use, so sequential commands that share a name accumulate in
//! one file. Followers stream a file to the operator's terminal; the
//! [`FollowerRegistry`] guarantees a single live follower per path no matter
//! how many producers write to it.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use crate::command::CommandSpec;
use crate::registry::{ProcessHandle, ProcessRegistry, Role};

/// Errors raised while opening log files or starting followers.
#[derive(Debug, Error)]
pub enum LogError {
    /// The logical name cannot be used as a file name.
    #[error("invalid log name {0:?}")]
    InvalidName(String),

    /// The log directory could not be prepared.
    #[error("failed to prepare log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A log file could not be opened or written.
    #[error("failed to open log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The follower command could not be launched.
    #[error("failed to start follower `{command}` for {path}: {source}")]
    Follower {
        command: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An open, append-mode log file bound to a logical name.
#[derive(Debug)]
pub struct LogStream {
    name: String,
    path: PathBuf,
    file: File,
}

impl LogStream {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line directly to the file.
    pub fn append_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.file, "{line}")?;
        self.file.flush()
    }

    /// Stdio pair routing a child's stdout and stderr into this file.
    pub fn stdio(&self) -> io::Result<(Stdio, Stdio)> {
        let stdout = self.file.try_clone()?;
        let stderr = self.file.try_clone()?;
        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }
}

/// The command used to follow a log file.
///
/// The literal argument `{path}` is replaced with the file being followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl FollowerCommand {
    pub const PATH_PLACEHOLDER: &'static str = "{path}";

    fn for_path(&self, path: &Path) -> CommandSpec {
        let path = path.to_string_lossy();
        CommandSpec::new(&self.program).args(
            self.args
                .iter()
                .map(|arg| arg.replace(Self::PATH_PLACEHOLDER, &path)),
        )
    }
}

impl Default for FollowerCommand {
    /// `tail -n +1 -F {path}`: replay from the top, survive truncation.
    fn default() -> Self {
        Self {
            program: "tail".to_string(),
            args: ["-n", "+1", "-F", Self::PATH_PLACEHOLDER]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Maps each followed file path to its single live follower.
#[derive(Debug, Default)]
pub struct FollowerRegistry {
    active: tokio::sync::Mutex<HashMap<PathBuf, ProcessHandle>>,
}

impl FollowerRegistry {
    /// The follower currently recorded for `path`, live or not.
    pub async fn get(&self, path: &Path) -> Option<ProcessHandle> {
        self.active.lock().await.get(path).cloned()
    }

    pub async fn len(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.active.lock().await.is_empty()
    }
}

/// Owns the log directory for one run.
#[derive(Debug)]
pub struct LogMux {
    dir: PathBuf,
    opened: Mutex<HashSet<String>>,
    followers: FollowerRegistry,
    follower_command: FollowerCommand,
}

impl LogMux {
    /// Prepare `dir` for a new run: create it, and remove `*.log` files left
    /// over from a previous run.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, LogError> {
        let dir = dir.into();
        let dir_err = |source| LogError::Directory {
            path: dir.clone(),
            source,
        };

        std::fs::create_dir_all(&dir).map_err(dir_err)?;
        for entry in std::fs::read_dir(&dir).map_err(dir_err)? {
            let path = entry.map_err(dir_err)?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "log") {
                std::fs::remove_file(&path).map_err(dir_err)?;
                debug!(path = %path.display(), "removed stale log");
            }
        }

        Ok(Self {
            dir,
            opened: Mutex::new(HashSet::new()),
            followers: FollowerRegistry::default(),
            follower_command: FollowerCommand::default(),
        })
    }

    /// Replace the command used to start followers.
    pub fn with_follower_command(mut self, command: FollowerCommand) -> Self {
        self.follower_command = command;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn followers(&self) -> &FollowerRegistry {
        &self.followers
    }

    /// Path of the file backing `name`. Does not create it.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, LogError> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.log")))
    }

    /// Open the stream for `name`, truncating it on first use in this run.
    pub fn open_log(&self, name: &str) -> Result<LogStream, LogError> {
        let path = self.path_for(name)?;
        let open_err = |source| LogError::Open {
            path: path.clone(),
            source,
        };

        let first_use = self
            .opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
        if first_use {
            File::create(&path).map_err(open_err)?;
            debug!(name, path = %path.display(), "created log");
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        Ok(LogStream {
            name: name.to_string(),
            path,
            file,
        })
    }

    /// Return the live follower for `path`, starting one if there is none.
    ///
    /// The lookup and the launch happen under one lock, so concurrent
    /// callers for the same path share a single follower. A recorded
    /// follower that has exited is replaced.
    pub async fn ensure_follower(
        &self,
        path: &Path,
        registry: &ProcessRegistry,
    ) -> Result<ProcessHandle, LogError> {
        let mut active = self.followers.active.lock().await;

        if let Some(existing) = active.get(path) {
            if registry.is_running(existing).await {
                return Ok(existing.clone());
            }
            debug!(path = %path.display(), pid = existing.pid, "follower exited; replacing");
        }

        let spec = self.follower_command.for_path(path);
        let launch_err = |source| LogError::Follower {
            command: spec.to_string(),
            path: path.to_path_buf(),
            source,
        };

        let mut cmd = spec.to_command();
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        let child = cmd.spawn().map_err(launch_err)?;
        let pid = child
            .id()
            .ok_or_else(|| launch_err(io::Error::other("follower exited before it was tracked")))?;

        let name = follower_name(path);
        let handle = registry.register(&name, Role::Follower, pid, child);
        info!(path = %path.display(), pid, "following log");
        active.insert(path.to_path_buf(), handle.clone());
        Ok(handle)
    }
}

fn follower_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    format!("follow:{stem}")
}

fn validate_name(name: &str) -> Result<(), LogError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        Err(LogError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_follower() -> FollowerCommand {
        // Same lifetime semantics as tail -F without echoing to the test output.
        FollowerCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exec tail -n +1 -F \"$0\" > /dev/null".to_string(), "{path}".to_string()],
        }
    }

    #[test]
    fn create_removes_stale_logs_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.log"), "stale").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        let _mux = LogMux::create(dir.path()).unwrap();

        assert!(!dir.path().join("old.log").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn first_open_truncates_later_opens_append() {
        let dir = tempfile::tempdir().unwrap();
        let mux = LogMux::create(dir.path()).unwrap();

        let mut first = mux.open_log("client").unwrap();
        first.append_line("one").unwrap();
        let mut second = mux.open_log("client").unwrap();
        second.append_line("two").unwrap();

        let contents = std::fs::read_to_string(mux.path_for("client").unwrap()).unwrap();
        assert_eq!(contents, "one\ntwo\n");
    }

    #[test]
    fn first_open_truncates_file_created_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let mux = LogMux::create(dir.path()).unwrap();
        std::fs::write(dir.path().join("node-0.log"), "leftover\n").unwrap();

        let mut stream = mux.open_log("node-0").unwrap();
        stream.append_line("fresh").unwrap();

        let contents = std::fs::read_to_string(stream.path()).unwrap();
        assert_eq!(contents, "fresh\n");
    }

    #[test]
    fn rejects_names_that_escape_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mux = LogMux::create(dir.path()).unwrap();
        for name in ["", ".", "..", "a/b", "..\\x"] {
            assert!(
                matches!(mux.open_log(name), Err(LogError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn follower_command_substitutes_path() {
        let spec = FollowerCommand::default().for_path(Path::new("/tmp/logs/client.log"));
        assert_eq!(spec.program(), "tail");
        assert_eq!(spec.get_args(), ["-n", "+1", "-F", "/tmp/logs/client.log"]);
    }

    #[tokio::test]
    async fn ensure_follower_reuses_live_follower() {
        let dir = tempfile::tempdir().unwrap();
        let mux = LogMux::create(dir.path())
            .unwrap()
            .with_follower_command(quiet_follower());
        let registry = ProcessRegistry::new();
        let path = mux.open_log("client").unwrap().path().to_path_buf();

        let first = mux.ensure_follower(&path, &registry).await.unwrap();
        let second = mux.ensure_follower(&path, &registry).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.role, Role::Follower);
        assert_eq!(first.name, "follow:client");
        assert_eq!(registry.len(), 1);
        assert_eq!(mux.followers().len().await, 1);

        crate::cleanup::cleanup_all(&registry, std::time::Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn ensure_follower_replaces_dead_follower() {
        let dir = tempfile::tempdir().unwrap();
        let mux = LogMux::create(dir.path()).unwrap().with_follower_command(FollowerCommand {
            program: "true".to_string(),
            args: vec![],
        });
        let registry = ProcessRegistry::new();
        let path = mux.open_log("client").unwrap().path().to_path_buf();

        let first = mux.ensure_follower(&path, &registry).await.unwrap();
        registry.wait(&first).await.unwrap();
        let second = mux.ensure_follower(&path, &registry).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(mux.followers().get(&path).await, Some(second));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn missing_follower_binary_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mux = LogMux::create(dir.path()).unwrap().with_follower_command(FollowerCommand {
            program: "/nonexistent/follower".to_string(),
            args: vec![],
        });
        let registry = ProcessRegistry::new();
        let path = mux.open_log("x").unwrap().path().to_path_buf();

        let err = mux.ensure_follower(&path, &registry).await.unwrap_err();
        assert!(matches!(err, LogError::Follower { .. }));
        assert!(registry.is_empty());
        assert!(mux.followers().is_empty().await);
    }
}
