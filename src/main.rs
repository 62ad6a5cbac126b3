//! mqws-bridge - MQ to WebSocket message bridge
//!
//! Consumes one broker queue, relays each message to a WebSocket API and
//! publishes everything the API sends back to a second queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn, Instrument};

use mqws_bridge::bridge::Bridge;
use mqws_bridge::common::shutdown_signal;
use mqws_bridge::config::env::{apply_env_overrides, check_empty_env_vars, get_config_path, remote_token};
use mqws_bridge::config::{load_config, validate_settings, ConfigSource, Features, RemoteStore, Settings};
use mqws_bridge::gateway::AmqpBroker;
use mqws_bridge::socket::{Credentials, WsConnector};
use mqws_bridge::telemetry::{init_logging, shipping_span, BridgeMetrics, FacadeSink, LogOptions};

#[derive(Parser, Debug)]
#[command(name = "mqws-bridge")]
#[command(about = "MQ to WebSocket bridge")]
#[command(version)]
struct Cli {
    /// Seconds to run before shutting down (0 = run forever)
    #[arg(long, default_value_t = 60)]
    runsecs: u64,

    /// Enable info logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Config file (default: $MQWS_CONFIG or mq2wsbridge.conf)
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Read configuration from the remote store instead of the file
    #[arg(short = 's', long)]
    remote_config: bool,

    /// Remote store URL
    #[arg(short = 'r', long, default_value = "http://127.0.0.1:8500")]
    remote_url: String,

    /// Copy the config file into the remote store (overwriting) before starting
    #[arg(short = 'M', long, requires = "remote_config")]
    migrate: bool,

    /// Stub mode: loop the inbound queue to the outbound queue without a WebSocket
    #[arg(short = 'X', long)]
    stub: bool,

    /// Structured (JSON) log lines for log shipping
    #[arg(short = 'l', long)]
    log_shipping: bool,

    /// Emit metrics
    #[arg(short = 'm', long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogOptions {
        info: cli.verbose,
        debug: cli.debug,
        json: cli.log_shipping,
        ..LogOptions::default()
    })
    .context("Failed to install logger")?;

    info!("mqws-bridge v{} starting...", env!("CARGO_PKG_VERSION"));

    let source = load_source(&cli).await.map_err(|e| {
        error!("Failed to load configuration: {:#}", e);
        e
    })?;
    info!("Configuration loaded from {}", source.describe());

    for var in check_empty_env_vars() {
        warn!("Environment variable {} is set but empty; ignoring", var);
    }

    let settings = apply_env_overrides(Settings::from_source(source.as_ref())?);
    let features = Features {
        stub: cli.stub,
        remote_logs: cli.log_shipping,
        metrics: cli.metrics,
    };
    validate_settings(&settings, &features).map_err(|e| {
        error!("Invalid configuration:\n{}", e);
        e
    })?;

    let span = shipping_span(&LogOptions {
        log_group: settings.observability.log_group.clone(),
        log_stream: settings.observability.log_stream.clone(),
        retention_days: Some(settings.observability.retention_days),
        ..LogOptions::default()
    });

    run(cli, settings).instrument(span).await.map_err(|e| {
        error!("{:#}", e);
        e
    })?;

    info!("Exiting...");
    Ok(())
}

async fn run(cli: Cli, settings: Settings) -> Result<()> {
    if cli.stub {
        info!(
            "Stub mode: messages on '{}' are echoed to '{}'",
            settings.broker.queue_to_socket, settings.broker.queue_from_socket
        );
    } else {
        info!("WebSocket API: {}{}", settings.socket.api_host, settings.socket.api_uri);
    }
    info!("  To WebSocket: {}", settings.broker.queue_to_socket);
    info!(
        "  From WebSocket: {} (TTL {} ms)",
        settings.broker.queue_from_socket, settings.broker.ttl_from_socket_ms
    );

    let connector = if cli.stub {
        None
    } else {
        Some(WsConnector::new(Credentials::from_settings(&settings.socket)?))
    };

    let metrics = BridgeMetrics::new();
    let broker = AmqpBroker::connect(&settings.broker, metrics.clone()).await?;

    let namespace = settings.observability.metrics_namespace.clone();
    let mut bridge = Bridge::new(settings, Arc::new(broker), metrics);
    if cli.metrics {
        if let Some(namespace) = namespace {
            bridge = bridge.with_metrics_sink(Arc::new(FacadeSink::new(namespace)));
        }
    }

    let run_for = (cli.runsecs > 0).then(|| Duration::from_secs(cli.runsecs));
    match run_for {
        Some(duration) => info!("Running for {} seconds", duration.as_secs()),
        None => info!("Running until stopped"),
    }

    bridge.run(connector, run_for, shutdown_signal()).await?;
    Ok(())
}

/// File or remote configuration, migrating the file first when asked to.
async fn load_source(cli: &Cli) -> Result<Box<dyn ConfigSource>> {
    let path = cli.config.clone().unwrap_or_else(get_config_path);

    if !cli.remote_config {
        info!("Loading configuration from {}...", path);
        return Ok(Box::new(load_config(&path)?));
    }

    let store = RemoteStore::new(cli.remote_url.clone(), remote_token());
    if cli.migrate {
        let file = load_config(&path)?;
        let written = store.migrate(&file).await?;
        info!("Migrated {} keys from {} to {}", written, path, cli.remote_url);
    }

    info!("Loading configuration from {}...", cli.remote_url);
    Ok(Box::new(store.snapshot().await?))
}
