//! Shared test utilities for corral integration tests.
//!
//! Provides a passthrough [`LocalEnvironment`] that runs everything on the
//! host, and [`FakePrograms`]: shell-script stand-ins for the node, client,
//! and accelerator binaries, written into a temporary directory.

use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use corral_core::build::Binaries;
use corral_core::cluster::ClusterConfig;
use corral_core::env::{EnvError, EnvironmentController};
use corral_core::logs::FollowerCommand;
use corral_core::spawn::SpawnOptions;
use corral_core::{CommandSpec, RunContext};

/// Environment controller that runs commands on the host, tagging them with
/// `CORRAL_ENV`, and reports loopback as every address.
///
/// Programs given by path are run as `sh <program> <args>`, so fake
/// programs never need the executable bit.
#[derive(Debug, Default)]
pub struct LocalEnvironment {
    setups: Mutex<Vec<String>>,
}

impl LocalEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environments whose setup command has been requested, in order.
    pub fn setups(&self) -> Vec<String> {
        self.setups.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EnvironmentController for LocalEnvironment {
    fn name(&self) -> &str {
        "local"
    }

    fn setup(&self, env: &str) -> CommandSpec {
        if let Ok(mut setups) = self.setups.lock() {
            setups.push(env.to_string());
        }
        CommandSpec::new("true")
    }

    fn exec(&self, env: &str, command: &CommandSpec) -> CommandSpec {
        let wrapped = if command.program().contains('/') {
            CommandSpec::new("sh").arg(command.program())
        } else {
            CommandSpec::new(command.program())
        };
        let mut wrapped = wrapped
            .args(command.get_args().iter().cloned())
            .env("CORRAL_ENV", env);
        for (key, value) in command.get_env() {
            wrapped = wrapped.env(key, value);
        }
        wrapped
    }

    async fn status(&self, env: &str) -> Result<Value, EnvError> {
        Ok(json!({
            "name": env,
            "address": IpAddr::V4(Ipv4Addr::LOCALHOST).to_string(),
        }))
    }
}

/// Script run for `client write <addr> <value>` / `client read <addr>`.
pub const CLIENT_SCRIPT: &str = r#"case "$1" in
  write) echo "wrote $3 to $2" ;;
  read) echo "read from $2" ;;
  *) echo "unknown op $1" >&2; exit 64 ;;
esac
"#;

/// Long-running stand-in for a service: `node <id> <count>`.
pub const NODE_SCRIPT: &str = "echo \"node $1 of $2 in $CORRAL_ENV\"\nexec sleep 300\n";

/// Long-running stand-in for an accelerator: `accelerator <iface>`.
pub const ACCELERATOR_SCRIPT: &str = "echo \"attached to $1\"\nexec sleep 300\n";

/// Environment tool speaking the `setup` / `exec` / `status` protocol on
/// the host. Run it as `sh <script> ...`. Like [`LocalEnvironment`], it runs
/// programs given by path through `sh`.
pub const ENV_TOOL_SCRIPT: &str = r#"cmd="$1"; shift
case "$cmd" in
  setup) exit 0 ;;
  exec)
    CORRAL_ENV="$1"; export CORRAL_ENV; shift 2
    case "$1" in
      */*) exec sh "$@" ;;
      *) exec "$@" ;;
    esac ;;
  status) printf '{"name":"%s","interfaces":[{"name":"veth0","address":"127.0.0.1/8"}]}\n' "$1" ;;
  *) echo "unknown command $cmd" >&2; exit 64 ;;
esac
"#;

/// Fake cluster programs, plus an environment tool, in a temporary
/// directory.
pub struct FakePrograms {
    dir: TempDir,
    pub binaries: Binaries,
    env_tool: PathBuf,
}

impl FakePrograms {
    pub fn new() -> Self {
        Self::with_client(CLIENT_SCRIPT)
    }

    /// Fake programs with a custom client script.
    pub fn with_client(client_script: &str) -> Self {
        let dir = TempDir::new().expect("failed to create fake program dir");
        let write = |name: &str, body: &str| -> PathBuf {
            let path = dir.path().join(name);
            std::fs::write(&path, body)
                .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
            path
        };
        let binaries = Binaries {
            node: write("node", NODE_SCRIPT),
            client: write("client", client_script),
            accelerator: write("accelerator", ACCELERATOR_SCRIPT),
        };
        let env_tool = write("envtool", ENV_TOOL_SCRIPT);
        Self {
            dir,
            binaries,
            env_tool,
        }
    }

    /// Replace the node script.
    pub fn with_node(self, node_script: &str) -> Self {
        std::fs::write(&self.binaries.node, node_script)
            .unwrap_or_else(|e| panic!("failed to write {}: {e}", self.binaries.node.display()));
        self
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Path of the [`ENV_TOOL_SCRIPT`] copy.
    pub fn env_tool(&self) -> &Path {
        &self.env_tool
    }
}

impl Default for FakePrograms {
    fn default() -> Self {
        Self::new()
    }
}

/// Follower that behaves like `tail -F` but writes nowhere, keeping test
/// output clean.
pub fn quiet_follower() -> FollowerCommand {
    FollowerCommand {
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "exec tail -n +1 -F \"$0\" > /dev/null 2>&1".to_string(),
            FollowerCommand::PATH_PLACEHOLDER.to_string(),
        ],
    }
}

/// A run context logging into `log_dir` with a quiet follower and a short
/// kill grace period.
pub fn test_context(log_dir: &Path) -> RunContext {
    RunContext::new(log_dir)
        .expect("failed to create run context")
        .with_follower_command(quiet_follower())
        .with_kill_grace(Duration::from_secs(2))
}

/// Cluster config over `programs` with silent accelerators and services and
/// no settle delay.
pub fn test_cluster_config(programs: &FakePrograms, nodes: usize) -> ClusterConfig {
    ClusterConfig {
        nodes: NonZeroUsize::new(nodes).expect("node count must be positive"),
        env_prefix: "node".to_string(),
        interface: "veth0".to_string(),
        binaries: programs.binaries.clone(),
        settle: Duration::ZERO,
        workload_value: "42".to_string(),
        services: SpawnOptions::silent(),
        accelerators: SpawnOptions::silent(),
        network_toggles: Vec::new(),
        wait_for_services: false,
    }
}
