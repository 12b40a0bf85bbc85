//! fedmon - metrics/event collector and SDN flow manager for a
//! federated-learning testbed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fedmon::api::{self, AppState};
use fedmon::collector::Collector;
use fedmon::models::Config;

#[derive(Debug, Parser)]
#[command(name = "fedmon", about = "FL testbed metrics collector and flow manager")]
struct Args {
    /// Path to a JSON configuration file overlaying the environment.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_ascii_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let args = Args::parse();

    // Bootstrap logging from the environment; the config file may not have
    // been read yet, but LOG_LEVEL covers both paths.
    init_tracing(&std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()));

    match run(args).await {
        Ok(()) => {
            info!("Collector shutdown complete.");
        }
        Err(e) => {
            error!("Unrecoverable error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("Starting Metrics Collector...");
    let config = Arc::new(Config::load(args.config.as_deref())?);

    let collector = Collector::new(config.clone())?;

    // Startup policy gate: an explicit deny aborts only in strict mode.
    if !collector.check_policy().await {
        if config.strict_policy_mode {
            anyhow::bail!("Collector startup aborted due to policy denial (strict mode)");
        }
        warn!("Policy check denied but strict mode is off; proceeding with collection");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = collector.spawn_jobs(shutdown_rx.clone());

    // API server runs in the foreground so a failed bind aborts startup.
    let api_handle = if config.api_enabled {
        let state = AppState {
            storage: collector.storage.clone(),
            config: config.clone(),
            network_monitor: collector.network_monitor.clone(),
            fl_monitor: collector.fl_monitor.clone(),
            fl_client: collector.fl_client.clone(),
            policy_client: collector.policy_client.clone(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("Failed to build API HTTP client")?,
            fl_cache: Arc::new(api::fl::FlMetricsCache::default()),
        };
        Some(tokio::spawn(api::run_server(state, shutdown_rx.clone())))
    } else {
        info!("API server disabled");
        None
    };

    // Wait for SIGINT/SIGTERM, or for the API server to die early.
    let signalled = wait_for_shutdown(api_handle.as_ref().map(|h| h.abort_handle())).await;
    match signalled {
        ShutdownCause::Signal => info!("Received termination signal. Shutting down..."),
        ShutdownCause::ApiExit => {}
    }

    // Cooperative shutdown: flip the flag, give workers a bounded window,
    // then close storage regardless.
    let _ = shutdown_tx.send(true);
    let join_all = async {
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(handle) = api_handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {}
            }
        }
        Ok(())
    };
    match tokio::time::timeout(Duration::from_secs(10), join_all).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            collector.storage.close();
            return Err(e);
        }
        Err(_) => warn!("Workers did not stop within the grace period; detaching"),
    }

    collector.storage.close();
    info!("Storage connections closed.");
    Ok(())
}

enum ShutdownCause {
    Signal,
    ApiExit,
}

/// Block until SIGINT or SIGTERM arrives. If the API server task finishes
/// first (e.g. bind failure), return immediately so the error propagates.
async fn wait_for_shutdown(api_abort: Option<tokio::task::AbortHandle>) -> ShutdownCause {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let api_finished = async {
        match api_abort {
            Some(handle) => {
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => ShutdownCause::Signal,
        _ = terminate => ShutdownCause::Signal,
        _ = api_finished => ShutdownCause::ApiExit,
    }
}
