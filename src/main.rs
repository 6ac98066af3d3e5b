use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use memoryd::client;
use memoryd::config::DaemonConfig;
use memoryd::daemon::liveness::LivenessMarker;
use memoryd::daemon::Daemon;
use memoryd::shutdown::{signals, ShutdownOrchestrator, ShutdownReason};

#[derive(Parser)]
#[command(name = "memoryd", version, about = "Persistence daemon for agent memory")]
struct Cli {
    /// Config file (defaults to ~/.memoryd/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground
    Serve,
    /// Print the status document of the running daemon
    Status,
    /// Call a method on the running daemon
    Call {
        method: String,
        /// JSON params object
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Ask the running daemon to shut down
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DaemonConfig::load_from(path)?,
        None => DaemonConfig::load()?,
    };

    // Log to stderr so stdout stays clean for command output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Status => {
            let response = call_running(&config, "getStatus", serde_json::json!({})).await?;
            print_response(&response)
        }
        Command::Call { method, params } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("--params must be valid JSON")?;
            let response = call_running(&config, &method, params).await?;
            print_response(&response)
        }
        Command::Stop => stop(&config),
    }
}

async fn serve(config: DaemonConfig) -> Result<()> {
    let orchestrator = ShutdownOrchestrator::new(config.shutdown.clone());
    let fatal = signals::install(orchestrator.clone())?;

    let daemon = Daemon::new(config);
    daemon.set_fatal_reporter(fatal);
    daemon.register_shutdown_handlers(&orchestrator)?;

    let outcome = match daemon.start().await {
        Ok(outcome) => outcome,
        Err(e) => {
            orchestrator
                .shutdown(ShutdownReason::Fatal(format!("{e:#}")))
                .await;
            return Err(e);
        }
    };
    if outcome.already_running {
        println!("memoryd already running at {}", outcome.address);
        return Ok(());
    }
    eprintln!("memoryd listening on {}", outcome.address);

    let report = orchestrator.wait().await;
    std::process::exit(report.exit_code);
}

async fn call_running(
    config: &DaemonConfig,
    method: &str,
    params: serde_json::Value,
) -> Result<memoryd::protocol::Response> {
    let dir = config.storage.resolved_dir();
    let Some(marker) = LivenessMarker::read(&dir)? else {
        bail!("no daemon running for {}", dir.display());
    };
    if !marker.is_alive() {
        bail!("daemon pid {} is not running (stale marker)", marker.pid);
    }
    client::call(&marker.address()?, method, params).await
}

fn print_response(response: &memoryd::protocol::Response) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(unix)]
fn stop(config: &DaemonConfig) -> Result<()> {
    let dir = config.storage.resolved_dir();
    let Some(marker) = LivenessMarker::read(&dir)? else {
        bail!("no daemon running for {}", dir.display());
    };
    if !marker.is_alive() {
        LivenessMarker::remove(&dir)?;
        bail!("daemon pid {} was not running; removed stale marker", marker.pid);
    }
    let pid = libc::pid_t::try_from(marker.pid).context("pid out of range")?;
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        return Err(std::io::Error::last_os_error()).context("failed to signal daemon");
    }
    println!("sent SIGTERM to memoryd (pid {})", marker.pid);
    Ok(())
}

#[cfg(not(unix))]
fn stop(_config: &DaemonConfig) -> Result<()> {
    bail!("`memoryd stop` needs unix signals; use Ctrl-C in the serving terminal")
}
