use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use taskq_core::config::AppConfig;

use taskq::app::{AppMode, Application};
use taskq::shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("taskq")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Durable delayed-task scheduling over a streaming broker")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Config file path (default: search config/taskq.toml, taskq.toml, /etc/taskq/config.toml)"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("Which services to run")
                .value_parser(["scheduler", "worker", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Override worker.worker_id from config"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mode_str = matches.get_one::<String>("mode").map(String::as_str);
    let worker_id = matches.get_one::<String>("worker-id");

    let mut config = AppConfig::load(config_path.map(String::as_str))
        .context("failed to load configuration")?;
    if let Some(id) = worker_id {
        config.worker.worker_id = id.clone();
    }

    // Flags win over the config file for logging.
    let log_level = matches
        .get_one::<String>("log-level")
        .unwrap_or(&config.logs.level)
        .clone();
    let log_format = matches
        .get_one::<String>("log-format")
        .unwrap_or(&config.logs.format)
        .clone();
    init_logging(&log_level, &log_format)?;

    info!(mode = mode_str, "starting taskq");
    if let Some(path) = config_path {
        info!(config = %path, "configuration loaded");
    }

    let app_mode = parse_app_mode(mode_str.unwrap_or("all"), &config)?;
    let app = Arc::new(Application::new(config, app_mode).await?);

    let shutdown_manager = ShutdownManager::new();
    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!(error = %e, "application failed");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(result) => {
            if let Err(e) = result {
                error!(error = %e, "error while shutting down");
            } else {
                info!("shut down cleanly");
            }
        }
        Err(_) => {
            warn!("shutdown timed out, exiting anyway");
        }
    }

    Ok(())
}

fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("failed to initialize json logging")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("failed to initialize pretty logging")?;
        }
        other => {
            return Err(anyhow::anyhow!("unsupported log format: {other}"));
        }
    }

    Ok(())
}

fn parse_app_mode(mode_str: &str, config: &AppConfig) -> Result<AppMode> {
    match mode_str {
        "scheduler" => {
            if !config.scheduler.enabled {
                return Err(anyhow::anyhow!(
                    "scheduler mode requested but disabled in configuration"
                ));
            }
            Ok(AppMode::Scheduler)
        }
        "worker" => {
            if !config.worker.enabled {
                return Err(anyhow::anyhow!(
                    "worker mode requested but disabled in configuration"
                ));
            }
            Ok(AppMode::Worker)
        }
        "all" => Ok(AppMode::All),
        other => Err(anyhow::anyhow!("unsupported mode: {other}")),
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
