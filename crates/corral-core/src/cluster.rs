//! Cluster driver: stand up one accelerator and one service per environment,
//! run the workload against them, and optionally wait on the services.
//!
//! Sequence:
//! 1. Set up each environment (best-effort) and apply network toggles
//!    (best-effort).
//! 2. Spawn an accelerator and a service in each environment.
//! 3. Sleep for the settle delay. Services are assumed ready afterwards;
//!    nothing checks that they are.
//! 4. Resolve each environment's address.
//! 5. Issue one write, then one read per node, through the bound runner.
//!    Any failed operation aborts the run.
//! 6. If asked, block until the services exit.
//!
//! Cleanup is not done here; the caller wraps this in
//! [`run_scoped`](crate::scope::run_scoped).

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::build::Binaries;
use crate::command::CommandSpec;
use crate::context::RunContext;
use crate::env::{EnvironmentController, parse_address};
use crate::policy::{best_effort, required};
use crate::registry::ProcessHandle;
use crate::runner::RunOptions;
use crate::spawn::SpawnOptions;

/// Log name shared by every workload operation.
pub const CLIENT_LOG: &str = "client";
/// Log name shared by environment setup and toggles.
pub const ENV_LOG: &str = "env";

/// Everything the driver needs to know about the cluster under test.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub nodes: NonZeroUsize,
    /// Environment names are `<env_prefix><index>`.
    pub env_prefix: String,
    /// Interface the accelerator attaches to inside each environment.
    pub interface: String,
    pub binaries: Binaries,
    /// Fixed delay between spawning services and issuing the workload.
    pub settle: Duration,
    /// Value written by the workload.
    pub workload_value: String,
    pub services: SpawnOptions,
    pub accelerators: SpawnOptions,
    /// Shell snippets run inside every environment after setup; failures
    /// are ignored.
    pub network_toggles: Vec<String>,
    /// Block on the services after the workload instead of returning.
    pub wait_for_services: bool,
}

impl ClusterConfig {
    pub fn env_name(&self, index: usize) -> String {
        format!("{}{index}", self.env_prefix)
    }
}

/// One node of a running cluster.
#[derive(Debug, Clone)]
pub struct Node {
    pub index: usize,
    pub env: String,
    pub address: Option<IpAddr>,
    pub accelerator: ProcessHandle,
    pub service: ProcessHandle,
}

/// Result of a completed cluster run.
#[derive(Debug, Clone)]
pub struct ClusterReport {
    pub nodes: Vec<Node>,
    /// Workload operations issued, in order (`write` first, then reads).
    pub operations: Vec<String>,
}

/// Run the cluster scenario in `ctx` against environments from `envs`.
pub async fn run_cluster(
    ctx: &RunContext,
    envs: &dyn EnvironmentController,
    config: &ClusterConfig,
) -> anyhow::Result<ClusterReport> {
    let count = config.nodes.get();
    let runner = ctx.runner();
    let spawner = ctx.spawner();
    let quiet = RunOptions { tail: false };

    info!(nodes = count, controller = envs.name(), "starting cluster");

    for index in 0..count {
        let env = config.env_name(index);
        best_effort(
            &format!("set up environment {env}"),
            runner.run_checked(ENV_LOG, &envs.setup(&env), quiet),
        )
        .await;
        for toggle in &config.network_toggles {
            let cmd = envs.exec(&env, &CommandSpec::shell(toggle));
            best_effort(
                &format!("apply `{toggle}` in {env}"),
                runner.run_checked(ENV_LOG, &cmd, quiet),
            )
            .await;
        }
    }

    let mut nodes = Vec::with_capacity(count);
    for index in 0..count {
        let env = config.env_name(index);

        let accel_cmd = envs.exec(
            &env,
            &CommandSpec::new(config.binaries.accelerator.to_string_lossy())
                .arg(&config.interface),
        );
        let accelerator = required(
            &format!("spawn accelerator in {env}"),
            spawner.spawn(&format!("accel-{index}"), &accel_cmd, config.accelerators),
        )
        .await?;

        let service_cmd = envs.exec(
            &env,
            &CommandSpec::new(config.binaries.node.to_string_lossy())
                .arg(index.to_string())
                .arg(count.to_string()),
        );
        let service = required(
            &format!("spawn service in {env}"),
            spawner.spawn(&format!("node-{index}"), &service_cmd, config.services),
        )
        .await?;

        nodes.push(Node {
            index,
            env,
            address: None,
            accelerator,
            service,
        });
    }

    info!(settle = ?config.settle, "waiting for services to settle");
    tokio::time::sleep(config.settle).await;

    for node in &mut nodes {
        let status = required(
            &format!("query status of {}", node.env),
            envs.status(&node.env),
        )
        .await?;
        let address = parse_address(&status)
            .with_context(|| format!("no usable address for {}", node.env))?;
        info!(env = %node.env, %address, "resolved node address");
        node.address = Some(address);
    }

    let operations = run_workload(ctx, envs, config, &nodes).await?;

    if config.wait_for_services {
        info!("workload complete; waiting for services to exit");
        for node in &nodes {
            let status = ctx
                .registry()
                .wait(&node.service)
                .await
                .with_context(|| format!("failed to wait for service in {}", node.env))?;
            info!(env = %node.env, %status, "service exited");
        }
    }

    Ok(ClusterReport { nodes, operations })
}

/// One write against the first node, then a read against every node, in
/// order, each run to completion before the next is issued.
async fn run_workload(
    ctx: &RunContext,
    envs: &dyn EnvironmentController,
    config: &ClusterConfig,
    nodes: &[Node],
) -> anyhow::Result<Vec<String>> {
    let runner = ctx.runner();
    let client = config.binaries.client.to_string_lossy().into_owned();
    let client_env = config.env_name(0);
    let address = |node: &Node| -> anyhow::Result<String> {
        node.address
            .map(|a| a.to_string())
            .with_context(|| format!("address of {} was never resolved", node.env))
    };

    let first = nodes.first().context("cluster has no nodes")?;
    let mut ops = vec![CommandSpec::new(&client)
        .arg("write")
        .arg(address(first)?)
        .arg(&config.workload_value)];
    for node in nodes {
        ops.push(CommandSpec::new(&client).arg("read").arg(address(node)?));
    }

    let mut issued = Vec::with_capacity(ops.len());
    for op in ops {
        let label = op.get_args().join(" ");
        required(
            &format!("client {label}"),
            runner.run_checked(CLIENT_LOG, &envs.exec(&client_env, &op), RunOptions::default()),
        )
        .await?;
        issued.push(label);
    }
    Ok(issued)
}
