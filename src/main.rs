use anyhow::Context;
use clap::{Parser, Subcommand};
use repo2md::config::ServerConfig;
use repo2md::server::{self, AppState};
use repo2md::subprocess::SubprocessManager;
use repo2md::workspace::{LivenessMonitor, PathSandbox, WorkspaceManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

/// Export repositories as Markdown for LLM conversations
#[derive(Parser)]
#[command(name = "repo2md")]
#[command(about = "Serve session-scoped repository workspaces and export them as Markdown", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP and WebSocket server (default command)
    Serve {
        /// Path to a TOML configuration file
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        /// Directory holding session workspaces
        #[arg(long)]
        root: Option<PathBuf>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to bind
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Delete every session workspace under the root and exit
    Clean {
        /// Directory holding session workspaces
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        2 => "trace",
        _ => "trace,hyper=debug,tower=debug",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("repo2md started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match cli.command {
        Some(Commands::Serve {
            config,
            root,
            host,
            port,
        }) => run_serve(config, root, host, port).await,
        Some(Commands::Clean { root }) => run_clean(root).await,
        None => run_serve(None, None, None, None).await,
    };

    if let Err(e) = result {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run_serve(
    config_path: Option<PathBuf>,
    root: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let mut config = ServerConfig::load(config_path.as_deref())?;
    config.apply_overrides(root, host, port);
    config.validate().context("Invalid configuration")?;
    debug!("Configuration: {:?}", config);

    let manager = Arc::new(
        WorkspaceManager::from_config(&config, SubprocessManager::production())
            .context("Failed to prepare workspace root")?,
    );

    // Workspaces left by a previous run have no live session
    manager.purge_all().await;

    let shutdown = CancellationToken::new();
    let monitor = LivenessMonitor::new(Arc::clone(&manager), config.sweep_interval)
        .spawn(shutdown.child_token());

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;
    let state = AppState::new(Arc::clone(&manager), config.api_url(), config.max_archive_bytes);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal_token.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let served = server::serve(listener, state, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = monitor.await {
        warn!("Liveness monitor ended abnormally: {}", e);
    }

    manager.purge_all().await;
    served
}

async fn run_clean(root: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = ServerConfig::load(None)?;
    config.apply_overrides(root, None, None);

    let sandbox = PathSandbox::new(&config.workspace_root).with_context(|| {
        format!(
            "Failed to open workspace root {}",
            config.workspace_root.display()
        )
    })?;
    let report = tokio::task::spawn_blocking(move || sandbox.delete_all()).await?;
    report.log("workspace root");

    println!(
        "Removed {} entries under {}",
        report.removed,
        report.target.display()
    );
    report.into_result()?;
    Ok(())
}
