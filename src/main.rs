//! Command Sandbox - Entry Point
//!
//! Loads configuration, checks the host, starts the reaper and serves the
//! HTTP API until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use command_sandbox::config::{DEFAULT_LISTEN, EngineConfig, FileConfig};
use command_sandbox::{Reaper, SandboxRegistry, server, system};

/// Command Sandbox - isolated command execution for interactive Git lessons.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "COMMAND_SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on [default: 127.0.0.1:8080]
    #[arg(short, long, env = "COMMAND_SANDBOX_LISTEN")]
    listen: Option<String>,

    /// Directory holding sandbox workspaces
    #[arg(long, env = "COMMAND_SANDBOX_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Skip host requirements checks
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("Command Sandbox v{}", env!("CARGO_PKG_VERSION"));

    // Command line overrides the file, which overrides the defaults
    let mut config = EngineConfig::default();
    let mut listen = None;
    if let Some(path) = &args.config {
        let file = FileConfig::load(path)?;
        listen = file.listen.clone();
        config = file.apply(config);
        info!(path = %path.display(), "Loaded configuration");
    }
    if let Some(root) = args.workspace_root {
        config = config.with_workspace_root(root);
    }
    let listen = args
        .listen
        .or(listen)
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    config.validate()?;

    if args.skip_checks {
        warn!("Skipping host requirements checks (--skip-checks)");
    } else {
        info!("Checking host requirements...");

        match system::check_all(&config.workspace_root, &config.runner_config().search_path) {
            Ok(reqs) => {
                info!(
                    "Host requirements satisfied: git {} at {}, workspace root {}",
                    reqs.git_version,
                    reqs.git_path.display(),
                    reqs.workspace_root.display()
                );
            }
            Err(e) => {
                error!("Host requirements check failed");
                return Err(e.into());
            }
        }
    }

    let registry = Arc::new(SandboxRegistry::open(&config)?);
    let reaper = Reaper::new(Arc::clone(&registry)).spawn().into_diagnostic()?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown requested");
    };

    let served = server::run(Arc::clone(&registry), &listen, shutdown).await;

    let destroyed = tokio::task::spawn_blocking(move || {
        reaper.shutdown();
        registry.destroy_all()
    })
    .await
    .into_diagnostic()?;
    info!(destroyed, "Sandboxes cleaned up");

    served.map_err(Into::into)
}
