//! Cleanup coordinator: bring every registered process to a terminal state.

use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::registry::{ProcessRegistry, ProcessState, Signal, signal_group};

/// Default time a process gets between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// What a cleanup pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Handles visited.
    pub visited: usize,
    /// Processes this pass forced down.
    pub terminated: usize,
    /// Processes found already in a terminal state.
    pub already_finished: usize,
    /// Processes that ignored SIGTERM for the whole grace period.
    pub escalated: usize,
    /// Finished processes whose group still had live members, which were
    /// sent SIGTERM.
    pub stray_groups: usize,
}

/// Terminate every still-running process in `registry`, in registration
/// order.
///
/// Every running process group gets SIGTERM up front; they then share one
/// `grace` deadline before stragglers get SIGKILL. Groups whose leader has
/// already exited are sent SIGTERM too, so backgrounded grandchildren do
/// not outlive the run. Errors from signalling or reaping are logged and
/// swallowed: this never fails, and a second call finds nothing to do.
pub async fn cleanup_all(registry: &ProcessRegistry, grace: Duration) -> CleanupReport {
    let mut report = CleanupReport::default();
    let mut signalled = Vec::new();

    for entry in registry.entries() {
        report.visited += 1;
        let handle = &entry.handle;
        let running = entry.slot.lock().await.refresh().is_running();

        if running {
            if let Err(e) = signal_group(handle.pid, Signal::Term) {
                debug!(name = %handle.name, pid = handle.pid, error = %e, "SIGTERM failed");
            }
            signalled.push(entry);
        } else {
            report.already_finished += 1;
            // ESRCH here means the group is empty, which is the normal case.
            if signal_group(handle.pid, Signal::Term).is_ok() {
                debug!(name = %handle.name, pid = handle.pid, "signalled leftover group members");
                report.stray_groups += 1;
            }
        }
    }

    let deadline = Instant::now() + grace;
    for entry in signalled {
        let handle = &entry.handle;
        let mut slot = entry.slot.lock().await;

        let current = slot.state;
        let state = match current {
            // Exited between the signal and now.
            ProcessState::Completed(status) => ProcessState::Terminated(Some(status)),
            ProcessState::Terminated(status) => ProcessState::Terminated(status),
            ProcessState::Running => match timeout_at(deadline, slot.child.wait()).await {
                Ok(Ok(status)) => ProcessState::Terminated(Some(status)),
                Ok(Err(e)) => {
                    debug!(name = %handle.name, pid = handle.pid, error = %e, "wait after SIGTERM failed");
                    ProcessState::Terminated(None)
                }
                Err(_) => {
                    warn!(
                        name = %handle.name,
                        pid = handle.pid,
                        grace = ?grace,
                        "process ignored SIGTERM; sending SIGKILL"
                    );
                    report.escalated += 1;
                    if let Err(e) = signal_group(handle.pid, Signal::Kill) {
                        debug!(name = %handle.name, pid = handle.pid, error = %e, "SIGKILL failed");
                    }
                    let _ = slot.child.start_kill();
                    ProcessState::Terminated(slot.child.wait().await.ok())
                }
            },
        };

        slot.state = state;
        report.terminated += 1;
        debug!(name = %handle.name, pid = handle.pid, role = %handle.role, "terminated");
    }

    info!(
        visited = report.visited,
        terminated = report.terminated,
        already_finished = report.already_finished,
        escalated = report.escalated,
        stray_groups = report.stray_groups,
        "cleanup complete"
    );
    report
}
