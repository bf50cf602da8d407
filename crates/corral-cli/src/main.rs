mod config;
mod run_cmd;

use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::Parser;

use corral_core::Interrupted;

use config::{CliOverrides, HarnessConfig};

#[derive(Parser)]
#[command(
    name = "corral",
    version,
    about = "Run a replicated-storage test cluster in isolated network environments"
)]
struct Cli {
    /// Number of nodes to start
    #[arg(short, long, default_value = "3")]
    nodes: NonZeroUsize,

    /// Build and run the debug profile instead of release
    #[arg(short, long)]
    debug: bool,

    /// Keep the services running after the workload until they exit
    #[arg(short, long)]
    wait: bool,

    /// Config file (defaults to ~/.config/corral/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for per-command log files (overrides CORRAL_LOG_DIR)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Skip the build step and use existing binaries
    #[arg(long)]
    no_build: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Diagnostics go to stderr; stdout carries the followed logs.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let file = config::load_for(cli.config.as_deref())?;
    let overrides = CliOverrides {
        log_dir: cli.log_dir.clone(),
    };
    let resolved = HarnessConfig::resolve(&overrides, file)?;

    let args = run_cmd::RunArgs {
        nodes: cli.nodes,
        debug: cli.debug,
        wait: cli.wait,
        build: !cli.no_build,
    };

    match run_cmd::run(args, &resolved).await {
        Ok(()) => Ok(()),
        Err(e) if e.is::<Interrupted>() => {
            eprintln!("\nRun interrupted; all processes cleaned up.");
            std::process::exit(130);
        }
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}
