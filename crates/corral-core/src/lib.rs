//! Process supervision for replicated-storage test clusters.
//!
//! ```text
//! RunContext ──┬── LogMux ── FollowerRegistry   (one file per name, ≤1 follower per file)
//!              └── ProcessRegistry              (every child, in spawn order)
//!
//! Spawner      spawn(name, cmd, opts)        -> ProcessHandle   (background)
//! BoundRunner  run_and_wait(name, cmd, opts) -> ExitStatus      (blocking)
//! cleanup_all(registry)                      -> CleanupReport   (infallible, idempotent)
//! run_scoped(ctx, cancel, body)              -> body result, cleanup on every exit path
//! ```

pub mod build;
pub mod cleanup;
pub mod cluster;
pub mod command;
pub mod context;
pub mod env;
pub mod logs;
pub mod policy;
pub mod registry;
pub mod runner;
pub mod scope;
pub mod spawn;

pub use command::CommandSpec;
pub use context::RunContext;
pub use registry::{ProcessHandle, ProcessState, Role};
pub use scope::{Interrupted, run_scoped};
