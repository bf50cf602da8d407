//! `corral`: build, stand up the cluster, drive the workload, tear down.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use corral_core::build::{self, Binaries, BuildProfile};
use corral_core::cluster::{ClusterConfig, ClusterReport, run_cluster};
use corral_core::env::ToolController;
use corral_core::policy::required;
use corral_core::{RunContext, run_scoped};

use crate::config::HarnessConfig;

/// Per-invocation choices taken from the command line.
#[derive(Debug, Clone, Copy)]
pub struct RunArgs {
    pub nodes: NonZeroUsize,
    pub debug: bool,
    pub wait: bool,
    pub build: bool,
}

/// Execute one harness run.
pub async fn run(args: RunArgs, config: &HarnessConfig) -> anyhow::Result<()> {
    let ctx = Arc::new(
        RunContext::new(&config.log_dir)
            .with_context(|| format!("failed to prepare log directory {}", config.log_dir.display()))?
            .with_follower_command(config.follower.clone())
            .with_kill_grace(config.kill_grace),
    );

    info!(
        run_id = %ctx.run_id(),
        log_dir = %config.log_dir.display(),
        nodes = args.nodes.get(),
        "starting run"
    );

    // Set up graceful shutdown: first signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone(), Arc::downgrade(&ctx));

    let profile = if args.debug {
        BuildProfile::Debug
    } else {
        BuildProfile::Release
    };

    let report = run_scoped(&ctx, &cancel, async {
        let binaries = if args.build {
            required(
                "build",
                build::build(&ctx.runner(), &config.project_dir, profile, &config.binaries),
            )
            .await?
        } else {
            Binaries::locate(&build::target_dir(&config.project_dir), profile, &config.binaries)
        };

        let envs = ToolController::new(&config.env_tool).with_base_args(&config.env_tool_args);
        let cluster = ClusterConfig {
            nodes: args.nodes,
            env_prefix: config.env_prefix.clone(),
            interface: config.interface.clone(),
            binaries,
            settle: config.settle,
            workload_value: config.workload_value.clone(),
            services: config.services,
            accelerators: config.accelerators,
            network_toggles: config.network_toggles.clone(),
            wait_for_services: args.wait,
        };
        run_cluster(&ctx, &envs, &cluster).await
    })
    .await?;

    print_report(&report);
    Ok(())
}

fn print_report(report: &ClusterReport) {
    println!();
    println!("Run complete: {} node(s).", report.nodes.len());
    for node in &report.nodes {
        let address = node
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {}  {address}", node.env);
    }
    println!("Operations:");
    for op in &report.operations {
        println!("  client {op}");
    }
}

/// First SIGINT/SIGTERM cancels the run so cleanup can proceed; a second one
/// SIGKILLs every process group the run started and exits immediately.
fn spawn_signal_handler(cancel: CancellationToken, ctx: Weak<RunContext>) {
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let mut interrupts = match Interrupts::new() {
        Ok(interrupts) => interrupts,
        Err(e) => {
            warn!(error = %e, "failed to install signal handlers");
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            if interrupts.recv().await.is_err() {
                return;
            }
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit; killing remaining processes.");
                // process::exit runs no destructors, so the registry's Drop
                // would never fire.
                if let Some(ctx) = ctx.upgrade() {
                    ctx.registry().kill_all_groups();
                }
                std::process::exit(130);
            }
            eprintln!("\nShutting down; cleaning up processes (Ctrl+C again to force)...");
            cancel.cancel();
        }
    });
}

/// SIGINT and, on unix, SIGTERM.
struct Interrupts {
    #[cfg(unix)]
    term: tokio::signal::unix::Signal,
}

impl Interrupts {
    #[cfg(unix)]
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            term: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> std::io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> std::io::Result<()> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = self.term.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await
    }
}
