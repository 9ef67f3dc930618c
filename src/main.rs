//! uia-bridge
//!
//! MCP server that runs UI automation operations in supervised worker
//! processes. The same binary serves as the worker when started with
//! `--worker`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use uia_bridge::config::{Config, FIXTURE_ENV};
use uia_bridge::supervisor::Supervisor;
use uia_bridge::transport::ProcessLauncher;
use uia_bridge::{mcp, worker};

#[derive(Parser, Debug)]
#[command(name = "uia-bridge")]
#[command(about = "MCP server for supervised UI automation")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Run as a worker process, serving line-delimited JSON on stdin/stdout
    #[arg(long, conflicts_with = "stdio")]
    worker: bool,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Desktop fixture for the in-memory automation backend
    #[arg(long)]
    fixture: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(level: &str, log_file: Option<&Path>, worker: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    // stdout carries the protocol in both modes
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            builder.with_writer(Mutex::new(file)).with_ansi(false).init();
        }
        // A worker's stderr is parsed by the host, so no colour codes.
        None => builder.with_writer(std::io::stderr).with_ansi(!worker).init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_file.as_deref(), args.worker)?;

    if args.worker {
        let fixture = args
            .fixture
            .or_else(|| std::env::var_os(FIXTURE_ENV).map(PathBuf::from));
        worker::serve_stdio(fixture.as_deref())?;
        return Ok(());
    }

    if !args.stdio {
        anyhow::bail!("Specify --stdio to run the MCP server or --worker to run a worker");
    }

    let mut config =
        Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(fixture) = args.fixture {
        config.worker.fixture = Some(fixture);
    }

    let command = config.worker_command(&args.log_level)?;
    info!(
        worker = %command.program.display(),
        pool_size = config.supervisor.pool_size,
        timeout_seconds = config.supervisor.default_timeout_seconds,
        restart = ?config.supervisor.restart,
        "Loaded configuration"
    );

    let supervisor = Arc::new(Supervisor::new(
        Arc::new(ProcessLauncher::new(command)),
        config.supervisor,
        config.defaults,
    ));

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(mcp::serve_stdio(supervisor))
}
