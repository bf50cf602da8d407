//! Per-run state shared by the spawner, runner, and cleanup coordinator.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::cleanup::{CleanupReport, DEFAULT_KILL_GRACE, cleanup_all};
use crate::logs::{FollowerCommand, LogError, LogMux};
use crate::registry::ProcessRegistry;
use crate::runner::BoundRunner;
use crate::spawn::Spawner;

/// Owns the log multiplexer and process registry for one harness run.
///
/// Everything that starts processes borrows from here; nothing is global.
#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    logs: LogMux,
    registry: ProcessRegistry,
    kill_grace: Duration,
}

impl RunContext {
    /// Start a run logging into `log_dir`, which is emptied of old logs.
    pub fn new(log_dir: impl Into<PathBuf>) -> Result<Self, LogError> {
        Ok(Self {
            run_id: Uuid::new_v4(),
            logs: LogMux::create(log_dir)?,
            registry: ProcessRegistry::new(),
            kill_grace: DEFAULT_KILL_GRACE,
        })
    }

    pub fn with_follower_command(mut self, command: FollowerCommand) -> Self {
        self.logs = self.logs.with_follower_command(command);
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn logs(&self) -> &LogMux {
        &self.logs
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn spawner(&self) -> Spawner<'_> {
        Spawner::new(&self.logs, &self.registry)
    }

    pub fn runner(&self) -> BoundRunner<'_> {
        BoundRunner::new(&self.logs, &self.registry)
    }

    /// Terminate everything this run started. Safe to call repeatedly.
    pub async fn cleanup_all(&self) -> CleanupReport {
        cleanup_all(&self.registry, self.kill_grace).await
    }
}
