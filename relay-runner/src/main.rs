//! Relay runner - executes control-plane work on an operator's machine.
//!
//! This daemon:
//! - Registers ephemeral, end-to-end-encrypted message queues with the
//!   Relay coordinator
//! - Long-polls the queues and dispatches messages to typed handlers
//! - Runs container-packaged agent turns through a local runtime
//! - Proxies read-only GitHub lookups over the operator's connections
//! - Autoscales its queue count to the observed load
//!
//! Configuration lives in a TOML file (see [`config::Config`]); the
//! runner token carries the tenant and runner identity.

mod backoff;
mod config;
mod docker;
mod error;
mod github;
mod poller;
mod runtime;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_api::{token, Client, ClientOptions, CoordinatorApi};

use config::Config;
use error::Error;
use poller::{Poller, PollerOptions};
use runtime::podman::PodmanProvider;
use runtime::RuntimeProvider;

/// How long shutdown waits for queues to drain before forcing exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(300);

/// Relay remote task runner
#[derive(Parser, Debug)]
#[command(name = "relay-runner", version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: platform-specific config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let data_dir = Config::default_data_dir();

    init_logging(&data_dir)?;

    if !config_path.exists() {
        eprintln!("Error: runner not configured\n");
        eprintln!("Create {} with:", config_path.display());
        eprintln!("  [runner]");
        eprintln!("  url = \"https://relay.example.com:7443\"");
        eprintln!("  token = \"rlyr_<token from the Relay console>\"");
        std::process::exit(1);
    }

    info!("Loading config from: {}", config_path.display());
    let config = Config::load(&config_path)?;

    let identity = token::parse_runner_token(&config.runner.token)?;
    info!(
        tenant_id = %identity.tenant_id,
        runner_id = %identity.runner_id,
        coordinator = %config.runner.url,
        "relay-runner starting"
    );

    let mut client_options = ClientOptions::default();
    if config.runner.skip_tls_verify || config.runner.url == "https://localhost:7443" {
        client_options.skip_tls_verify = true;
        warn!("TLS certificate verification is disabled");
    }
    let client = Client::new(&config.runner.url, &config.runner.token, client_options)?;

    let provider = build_runtime(&config, &data_dir)?;
    if !provider.is_installed() {
        warn!(
            runtime = provider.name(),
            "container runtime not found; agent invocations will fail"
        );
    }

    let options = PollerOptions {
        runtime: Some(provider),
        connections: config.connection_index(),
        ..Default::default()
    };
    let poller = Poller::new(
        Arc::new(client) as Arc<dyn CoordinatorApi>,
        &identity.tenant_id,
        &identity.runner_id,
        options,
    );

    shutdown_signal().await;

    info!("Received stop signal. Draining queues; this takes up to 30 seconds.");
    match poller.shutdown_timeout(SHUTDOWN_TIMEOUT).await {
        Ok(()) => info!("Queues drained successfully, shutting down"),
        Err(err) => {
            error!(error = %err, "Draining queues timed out, forcing shutdown");
            poller.close().await;
        }
    }

    Ok(())
}

fn build_runtime(config: &Config, data_dir: &Path) -> error::Result<Arc<dyn RuntimeProvider>> {
    match config.runner.runtime.as_str() {
        "podman" => Ok(Arc::new(PodmanProvider::new(
            None,
            data_dir.join("jobs"),
        ))),
        other => Err(Error::UnknownRuntime(other.to_string())),
    }
}

/// Initialize logging with file output and stdout.
fn init_logging(data_dir: &Path) -> anyhow::Result<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    // Daily rotating file appender (e.g., relay-runner.2026-08-02.log)
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("relay-runner")
        .filename_suffix("log")
        .build(&log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep the writer alive for the lifetime of the program
    std::mem::forget(guard);

    // Base filter suppresses noisy libraries, RUST_LOG layers on top
    let base = "hyper=warn,reqwest=warn,h2=warn,rustls=warn";
    let filter = match std::env::var("RUST_LOG") {
        Ok(env) => EnvFilter::new(format!("{base},{env}")),
        Err(_) => EnvFilter::new(format!("{base},info")),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false)) // stdout
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(non_blocking),
        ) // file
        .init();

    info!("Logging to: {}", log_dir.display());
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl-C).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl-C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
