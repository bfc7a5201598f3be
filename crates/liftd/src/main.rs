//! Daemon entry point: argument parsing, logging, signal wiring, and
//! the final status line.
//!
//! The event loop itself runs on a current-thread runtime so every
//! connection's state machine steps on one thread; the only thing that
//! reaches in from outside is the shutdown trigger, signaled by the
//! Unix signal watcher task.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use liftd::auth::FileValidator;
use liftd::config::{ConfigFile, DaemonConfig};
use liftd::events::ShutdownSignal;
use liftd::server::dispatch::Dispatcher;
use liftd::server::{self, ServerStatus};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// liftd - local privilege-elevation broker
#[derive(Parser, Debug)]
#[command(name = "liftd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "lift.toml")]
    config: PathBuf,

    /// Path to the listening socket
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to the credentials file
    #[arg(long)]
    credentials_file: Option<PathBuf>,

    /// Connection pool size
    #[arg(long)]
    max_connections: Option<usize>,

    /// Bound on each event wait, in milliseconds (0 waits forever)
    #[arg(long)]
    poll_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(&args) {
        Ok(ServerStatus::Ok) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<ServerStatus> {
    let config = load_config(args)?;

    let validator = FileValidator::load(&config.credentials_file).with_context(|| {
        format!(
            "failed to load credentials from {}",
            config.credentials_file.display()
        )
    })?;
    info!(records = validator.len(), "Credential store loaded");
    let dispatcher = Dispatcher::new(Box::new(validator));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    let mut status = ServerStatus::default();
    runtime.block_on(async {
        let shutdown = ShutdownSignal::new();
        tokio::spawn(watch_signals(shutdown.clone()));
        status = server::run(config.server_settings(), dispatcher, shutdown).await;
    });

    info!("Event loop returned: {status}");
    Ok(status)
}

fn load_config(args: &Args) -> Result<DaemonConfig> {
    let file = if args.config.exists() {
        ConfigFile::from_file(&args.config).context("failed to load configuration")?
    } else {
        ConfigFile::default()
    };

    let mut config = DaemonConfig::from_file_section(&file.daemon);
    if let Some(path) = &args.socket {
        config.socket_path.clone_from(path);
    }
    if let Some(path) = &args.credentials_file {
        config.credentials_file.clone_from(path);
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }
    if let Some(ms) = args.poll_timeout_ms {
        config.poll_timeout = (ms > 0).then(|| std::time::Duration::from_millis(ms));
    }
    Ok(config)
}

/// Turns SIGINT/SIGTERM into the shutdown trigger, naming the signal
/// for the operator.
async fn watch_signals(shutdown: ShutdownSignal) {
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    info!("Received {name}, quitting");
    shutdown.signal();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with_config(config: PathBuf) -> Args {
        Args {
            config,
            socket: None,
            credentials_file: None,
            max_connections: None,
            poll_timeout_ms: None,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn cli_overrides_beat_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("lift.toml");
        std::fs::write(
            &config_path,
            "[daemon]\n\
             socket = \"/tmp/lift/from-config.sock\"\n\
             max_connections = 4\n",
        )
        .unwrap();

        let mut args = args_with_config(config_path);
        args.socket = Some(PathBuf::from("/tmp/lift/from-cli.sock"));
        args.poll_timeout_ms = Some(100);

        let config = load_config(&args).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/lift/from-cli.sock"));
        assert_eq!(config.max_connections, 4);
        assert_eq!(
            config.poll_timeout,
            Some(std::time::Duration::from_millis(100))
        );
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let args = args_with_config(dir.path().join("missing.toml"));
        let config = load_config(&args).unwrap();
        assert_eq!(
            config.max_connections,
            liftd::config::DEFAULT_MAX_CONNECTIONS
        );
    }
}
