//! Run-wide registry of every process the harness has started.
//!
//! The registry owns each `tokio::process::Child` for the whole run.
//! Callers hold lightweight [`ProcessHandle`]s and go through the registry to
//! wait on, probe, or terminate the underlying process. Entries are appended
//! in spawn order and never removed; the cleanup coordinator walks them in
//! that order.

use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::process::Child;
use tracing::{debug, warn};

/// What a tracked process is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// A command whose output is being logged (service, accelerator, client).
    Producer,
    /// A log follower streaming a file to the operator.
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Follower => f.write_str("follower"),
        }
    }
}

/// Caller-side reference to a registered process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    /// Registry-assigned identifier, unique within the run.
    pub id: u64,
    /// Logical name the process was started under.
    pub name: String,
    /// Operating-system process id (also its process group id).
    pub pid: u32,
    pub role: Role,
}

/// Lifecycle state of a registered process.
///
/// `Completed` and `Terminated` are terminal: once reached, the state never
/// changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited on its own.
    Completed(ExitStatus),
    /// Forced down by cleanup. The status is `None` if it could not be reaped.
    Terminated(Option<ExitStatus>),
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }
}

pub(crate) struct Slot {
    pub(crate) child: Child,
    pub(crate) state: ProcessState,
}

impl Slot {
    /// Poll the child without blocking and record a natural exit.
    pub(crate) fn refresh(&mut self) -> ProcessState {
        if self.state.is_running() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.state = ProcessState::Completed(status),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "try_wait failed"),
            }
        }
        self.state
    }
}

pub(crate) struct Entry {
    pub(crate) handle: ProcessHandle,
    pub(crate) slot: tokio::sync::Mutex<Slot>,
}

/// Ordered collection of all processes started during one run.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: Mutex<Vec<Arc<Entry>>>,
    next_id: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a freshly spawned child and return its handle.
    pub fn register(&self, name: &str, role: Role, pid: u32, child: Child) -> ProcessHandle {
        let handle = ProcessHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            pid,
            role,
        };
        let entry = Arc::new(Entry {
            handle: handle.clone(),
            slot: tokio::sync::Mutex::new(Slot {
                child,
                state: ProcessState::Running,
            }),
        });
        self.lock_entries().push(entry);
        debug!(name, pid, %role, id = handle.id, "registered process");
        handle
    }

    /// Handles of every registered process, in registration order.
    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.lock_entries()
            .iter()
            .map(|entry| entry.handle.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Current state of `handle`, refreshed with a non-blocking exit check.
    ///
    /// Returns `None` for a handle this registry never issued.
    pub async fn state(&self, handle: &ProcessHandle) -> Option<ProcessState> {
        let entry = self.find(handle.id)?;
        let mut slot = entry.slot.lock().await;
        Some(slot.refresh())
    }

    pub async fn is_running(&self, handle: &ProcessHandle) -> bool {
        matches!(self.state(handle).await, Some(ProcessState::Running))
    }

    /// Block until `handle` exits and return its status.
    ///
    /// Waiting on a process that already reached a terminal state returns the
    /// recorded status immediately. Dropping the returned future leaves the
    /// process running and tracked.
    pub async fn wait(&self, handle: &ProcessHandle) -> io::Result<ExitStatus> {
        let entry = self.find(handle.id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("process {} ({}) is not registered", handle.id, handle.name),
            )
        })?;
        let mut slot = entry.slot.lock().await;
        match slot.state {
            ProcessState::Completed(status) | ProcessState::Terminated(Some(status)) => Ok(status),
            ProcessState::Terminated(None) => Err(io::Error::other(format!(
                "process {} ({}) was terminated and could not be reaped",
                handle.id, handle.name
            ))),
            ProcessState::Running => {
                let status = slot.child.wait().await?;
                slot.state = ProcessState::Completed(status);
                Ok(status)
            }
        }
    }

    /// SIGKILL every recorded process group without waiting or reaping.
    ///
    /// Synchronous, so it can run where awaiting is impossible: in `Drop`,
    /// or right before the process exits without cleanup. Groups are
    /// signalled even when their leader is busy in [`wait`](Self::wait) or
    /// has already exited. Returns how many groups still had members.
    pub fn kill_all_groups(&self) -> usize {
        let mut killed = 0;
        for entry in self.entries() {
            let handle = &entry.handle;
            if signal_group(handle.pid, Signal::Kill).is_ok() {
                debug!(name = %handle.name, pid = handle.pid, "killed process group");
                killed += 1;
            }
            if let Ok(mut slot) = entry.slot.try_lock() {
                if slot.refresh().is_running() {
                    let _ = slot.child.start_kill();
                }
            }
        }
        killed
    }

    /// Snapshot of entries for the cleanup coordinator.
    pub(crate) fn entries(&self) -> Vec<Arc<Entry>> {
        self.lock_entries().clone()
    }

    fn find(&self, id: u64) -> Option<Arc<Entry>> {
        self.lock_entries()
            .iter()
            .find(|entry| entry.handle.id == id)
            .cloned()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Entry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("handles", &self.handles())
            .finish()
    }
}

impl Drop for ProcessRegistry {
    /// Last line of defence when the run scope itself is torn down without
    /// reaching cleanup.
    fn drop(&mut self) {
        let killed = self.kill_all_groups();
        if killed > 0 {
            warn!(killed, "registry dropped with live processes; killed their groups");
        }
    }
}

/// Termination signals the harness sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Term,
    Kill,
}

/// Deliver `signal` to the process group led by `pid`.
///
/// `ESRCH` (group already gone) surfaces as an error; callers treat it as
/// expected.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: Signal) -> io::Result<()> {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {pid} out of range")))?;
    // SAFETY: killpg has no memory-safety preconditions; pgid is the group
    // of a child we spawned with `process_group(0)`.
    let ret = unsafe { libc::killpg(pgid, signo) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pid: u32, _signal: Signal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSpec;

    fn spawn_child(spec: &CommandSpec) -> (u32, Child) {
        let child = spec.to_command().spawn().unwrap();
        let pid = child.id().unwrap();
        (pid, child)
    }

    #[tokio::test]
    async fn register_assigns_sequential_ids_in_order() {
        let registry = ProcessRegistry::new();
        let (pid_a, a) = spawn_child(&CommandSpec::new("true"));
        let (pid_b, b) = spawn_child(&CommandSpec::new("true"));

        let first = registry.register("a", Role::Producer, pid_a, a);
        let second = registry.register("b", Role::Follower, pid_b, b);

        assert_eq!(first.id + 1, second.id);
        let handles = registry.handles();
        assert_eq!(handles, vec![first.clone(), second.clone()]);
        assert_eq!(registry.len(), 2);

        registry.wait(&first).await.unwrap();
        registry.wait(&second).await.unwrap();
    }

    #[tokio::test]
    async fn wait_records_completion() {
        let registry = ProcessRegistry::new();
        let (pid, child) = spawn_child(&CommandSpec::shell("exit 3"));
        let handle = registry.register("exit3", Role::Producer, pid, child);

        let status = registry.wait(&handle).await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(
            registry.state(&handle).await,
            Some(ProcessState::Completed(status))
        );

        // A second wait returns the recorded status.
        let again = registry.wait(&handle).await.unwrap();
        assert_eq!(again.code(), Some(3));
    }

    #[tokio::test]
    async fn is_running_tracks_live_process() {
        let registry = ProcessRegistry::new();
        let (pid, child) = spawn_child(&CommandSpec::new("sleep").arg("30"));
        let handle = registry.register("sleeper", Role::Producer, pid, child);

        assert!(registry.is_running(&handle).await);

        signal_group(pid, Signal::Kill).unwrap();
        registry.wait(&handle).await.unwrap();
        assert!(!registry.is_running(&handle).await);
    }

    #[tokio::test]
    async fn unknown_handle_has_no_state() {
        let registry = ProcessRegistry::new();
        let stray = ProcessHandle {
            id: 99,
            name: "stray".to_string(),
            pid: 1,
            role: Role::Producer,
        };
        assert_eq!(registry.state(&stray).await, None);
        assert!(registry.wait(&stray).await.is_err());
    }

    #[tokio::test]
    async fn kill_all_groups_reaches_processes_being_waited_on() {
        let registry = Arc::new(ProcessRegistry::new());
        let (pid, child) = spawn_child(&CommandSpec::shell(
            "trap '' TERM; while true; do sleep 1; done",
        ));
        let handle = registry.register("stubborn", Role::Producer, pid, child);

        let waiter = {
            let registry = Arc::clone(&registry);
            let handle = handle.clone();
            tokio::spawn(async move { registry.wait(&handle).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(registry.kill_all_groups(), 1);
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("killed process was not reaped")
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(!registry.is_running(&handle).await);
    }

    #[test]
    fn role_display() {
        assert_eq!(Role::Producer.to_string(), "producer");
        assert_eq!(Role::Follower.to_string(), "follower");
    }
}
