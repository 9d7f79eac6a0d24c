//! bridge-influx - relays measurement points into InfluxDB

mod api;

use anyhow::Context;
use bridge_core::config::BridgeConfig;
use bridge_core::deadletter::{self, DeadLetterLog};
use bridge_core::metrics::PipelineMetrics;
use bridge_core::pipeline::Pipeline;
use bridge_core::writer::{HttpTransport, Writer};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bridge-influx", version, about = "Relay line protocol writes into InfluxDB")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides server.listen
    #[arg(long, global = true)]
    listen: Option<String>,

    /// InfluxDB API token, overrides influx.token
    #[arg(long, env = "INFLUX_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Accept writes over HTTP and relay them (default)
    Run,
    /// Resubmit batches from the dead-letter log, then exit
    Replay,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Replay => replay(config).await,
    }
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("loading configuration from {:?}", path))?,
        None => BridgeConfig::default(),
    };
    if let Some(listen) = &args.listen {
        config.server.listen = listen.clone();
    }
    if let Some(token) = &args.token {
        config.influx.token = Some(token.clone());
    }
    config.validate()?;

    if config.influx.bucket.is_empty() {
        warn!("influx.bucket is empty, writes will be rejected by the database");
    }
    Ok(config)
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let addr = config.listen_addr()?;
    let metrics = Arc::new(PipelineMetrics::new());

    info!("Starting bridge-influx {}", bridge_core::VERSION);
    info!("InfluxDB: {} (org {:?}, bucket {:?})", config.influx.url, config.influx.org, config.influx.bucket);
    info!("Dead-letter directory: {:?}", config.dead_letter.dir);

    let transport = HttpTransport::new(&config.influx())?;
    let dead_letters = Arc::new(DeadLetterLog::open(config.dead_letter())?);
    let pipeline = Pipeline::start(config.pipeline(), transport, dead_letters, metrics.clone());

    let app = api::create_router(api::AppState {
        pipeline: pipeline.handle(),
        metrics: metrics.clone(),
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("bridge-influx listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let report = pipeline.shutdown().await;
    info!(
        batches = report.batches_formed,
        abandoned = report.abandoned_batches,
        lost = report.lost_points,
        "Shutdown complete"
    );
    info!("{}", metrics.snapshot().format());
    Ok(())
}

async fn replay(config: BridgeConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(PipelineMetrics::new());
    let log = Arc::new(DeadLetterLog::open(config.dead_letter())?);
    let writer = Writer::new(
        HttpTransport::new(&config.influx())?,
        config.writer(),
        log.clone(),
        metrics,
    );

    let report = deadletter::replay(&log, &writer).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining");
}
