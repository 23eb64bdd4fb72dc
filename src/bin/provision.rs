use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use taskq_broker::{BrokerFactory, DelayedTaskQueue};
use taskq_core::config::AppConfig;
use taskq_core::traits::broker::{ProvisionOutcome, RetentionPolicy, StorageMode};

/// One-shot stream provisioning. Safe to run at every deployment:
/// an existing stream is reported, not an error.
#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("taskq-provision")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Ensure the delayed-task stream exists")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Config file path"),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .value_name("NAME")
                .help("Override delayed_stream.name"),
        )
        .arg(
            Arg::new("subject")
                .long("subject")
                .value_name("SUBJECT")
                .help("Override delayed_stream.subject"),
        )
        .arg(
            Arg::new("retention")
                .long("retention")
                .value_name("POLICY")
                .value_parser(["limits", "interest", "work_queue"]),
        )
        .arg(
            Arg::new("storage")
                .long("storage")
                .value_name("MODE")
                .value_parser(["file", "memory"]),
        )
        .get_matches();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialize logging")?;

    let config_path = matches.get_one::<String>("config");
    let mut config = AppConfig::load(config_path.map(String::as_str))
        .context("failed to load configuration")?;

    if let Some(name) = matches.get_one::<String>("name") {
        config.delayed_stream.name = name.clone();
    }
    if let Some(subject) = matches.get_one::<String>("subject") {
        config.delayed_stream.subject = subject.clone();
    }
    if let Some(retention) = matches.get_one::<String>("retention") {
        config.delayed_stream.retention = match retention.as_str() {
            "interest" => RetentionPolicy::Interest,
            "work_queue" => RetentionPolicy::WorkQueue,
            _ => RetentionPolicy::Limits,
        };
    }
    if let Some(storage) = matches.get_one::<String>("storage") {
        config.delayed_stream.storage = match storage.as_str() {
            "memory" => StorageMode::Memory,
            _ => StorageMode::File,
        };
    }
    config.delayed_stream.validate()?;

    let broker = BrokerFactory::create(&config.broker)
        .await
        .context("failed to connect to broker")?;
    let queue = DelayedTaskQueue::new(broker, config.delayed_stream.clone());

    match queue.provision().await? {
        ProvisionOutcome::Created => {
            println!("stream {} created", config.delayed_stream.name);
        }
        ProvisionOutcome::AlreadyExists => {
            println!("stream {} already exists", config.delayed_stream.name);
        }
    }

    Ok(())
}
