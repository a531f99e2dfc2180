//! conductor CLI: run a cluster member or inspect its WAL.

use anyhow::Context;
use clap::{Parser, Subcommand};
use conductor::config::{Config, Overrides, data_dir_from_env};
use conductor::store::Store;
use conductor::telemetry::{TelemetryConfig, init_telemetry};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "conductor", about = "Durable job queues fed from an event log")]
struct Cli {
    /// Log broker list (overrides CONDUCTOR_BROKERS)
    #[arg(short = 'k', long = "kafka", global = true)]
    brokers: Option<String>,
    /// Cluster name (overrides CONDUCTOR_NAME)
    #[arg(short, long, global = true)]
    name: Option<String>,
    /// Data directory (overrides CONDUCTOR_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the cluster topic and serve its queues
    Serve,
    /// Print WAL keys and the replay checkpoint
    Wal {
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Publish a job to the cluster topic
    Produce {
        workflow: String,
        /// Job name, unique within the workflow
        #[arg(value_name = "NAME")]
        job_name: String,
        /// Payload, taken as raw bytes
        data: Option<String>,
        /// State to queue the job under
        #[arg(long)]
        state: Option<String>,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            name: self.name.clone(),
            brokers: self.brokers.clone(),
            data_dir: self.data_dir.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match &cli.command {
        Command::Serve => cmd_serve(Config::from_env_with(cli.overrides())?).await,
        Command::Wal { limit } => cmd_wal(&cli, *limit),
        Command::Produce {
            workflow,
            job_name,
            data,
            state,
        } => {
            let config = Config::from_env_with(cli.overrides())?;
            cmd_produce(&config, workflow, job_name, data.as_deref(), state.as_deref()).await
        }
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "conductor".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let server = conductor::server::Server::open(&config)
        .with_context(|| format!("failed to open store under {}", config.store_dir().display()))?;

    server.start(log_consumer(&config)?).await?;

    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    server.stop().await?;
    Ok(())
}

fn cmd_wal(cli: &Cli, limit: usize) -> anyhow::Result<()> {
    let name = match &cli.name {
        Some(name) => name.clone(),
        None => std::env::var("CONDUCTOR_NAME").context("CONDUCTOR_NAME is not set")?,
    };
    let data_dir = cli.data_dir.clone().unwrap_or_else(data_dir_from_env);

    let store = Store::open(&data_dir, &name)?;
    let checkpoint = store.wal_offset();
    let entries = store.wal_entries(None, limit)?;

    println!("WAL:        {}", store.path().display());
    println!("Records:    {}", store.wal_len()?);
    println!(
        "Checkpoint: {}",
        checkpoint
            .as_deref()
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Partitions: {}", store.partitions().join(", "));
    println!("{}", "-".repeat(80));

    for (key, value) in &entries {
        let marker = if checkpoint.as_deref().is_some_and(|c| key.as_slice() <= c) {
            ' '
        } else {
            '*'
        };
        println!(
            "{marker} {:<60}  {} bytes",
            String::from_utf8_lossy(key),
            value.len()
        );
    }

    println!("\n{} record(s) shown, * = not yet replayed", entries.len());
    store.close();
    Ok(())
}

#[cfg(feature = "kafka")]
fn log_consumer(config: &Config) -> anyhow::Result<Box<dyn conductor::log::LogConsumer>> {
    Ok(Box::new(conductor::log::kafka::KafkaConsumer::from_config(
        config,
    )?))
}

#[cfg(not(feature = "kafka"))]
fn log_consumer(_config: &Config) -> anyhow::Result<Box<dyn conductor::log::LogConsumer>> {
    anyhow::bail!("conductor was built without Kafka support; rebuild with --features kafka")
}

#[cfg(feature = "kafka")]
async fn cmd_produce(
    config: &Config,
    workflow: &str,
    name: &str,
    data: Option<&str>,
    state: Option<&str>,
) -> anyhow::Result<()> {
    use conductor::log::LogProducer;
    use conductor::model::Job;

    let mut job = Job::new(workflow, name).data(data.unwrap_or_default());
    if let Some(state) = state {
        job = job.state(state);
    }

    let producer = conductor::log::kafka::KafkaProducer::from_config(config)?;
    producer.produce(&job).await?;
    println!("Produced: {} to {}", job.key(), config.name);
    Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn cmd_produce(
    _config: &Config,
    _workflow: &str,
    _name: &str,
    _data: Option<&str>,
    _state: Option<&str>,
) -> anyhow::Result<()> {
    anyhow::bail!("conductor was built without Kafka support; rebuild with --features kafka")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
