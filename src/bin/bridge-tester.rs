//! bridge-tester - round-trip delivery check for a running bridge
//!
//! Publishes numbered probes to the bridge's inbound queue and reports which
//! of them come back on the outbound queue, and how long each took.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use mqws_bridge::common::shutdown_signal;
use mqws_bridge::config::env::{apply_env_overrides, get_config_path};
use mqws_bridge::config::{load_config, validate_tester_settings, Settings};
use mqws_bridge::gateway::{AmqpBroker, QueueGateway};
use mqws_bridge::telemetry::{init_logging, BridgeMetrics, LogOptions};
use mqws_bridge::tester::{render_graph, render_table, ReconciliationEngine, ReconciliationReport, RunParams};

#[derive(Parser, Debug)]
#[command(name = "bridge-tester")]
#[command(about = "MQ to WebSocket bridge tester")]
#[command(version)]
struct Cli {
    /// Number of probes to send
    #[arg(short = 'n', long, default_value_t = 8)]
    number: usize,

    /// Seconds between probes
    #[arg(short = 'd', long, default_value_t = 1.0)]
    delay: f64,

    /// Seconds to wait for outstanding probes after the last one is sent
    #[arg(short = 'e', long = "end-delay", default_value_t = 30)]
    end_delay: u64,

    /// Consume every message on the return queue, ours or not
    #[arg(short = 'x', long)]
    exclusive: bool,

    /// Write the ids of unreconciled probes to this file
    #[arg(short = 'r', long)]
    report: Option<PathBuf>,

    /// Only report on our own probes
    #[arg(short = 'f', long)]
    focused: bool,

    /// Show a live table of sent and received probes
    #[arg(short = 'v', long)]
    visual: bool,

    /// Show a compact live graph of reconciled probes
    #[arg(short = 'g', long = "graph", conflicts_with = "visual")]
    graph: bool,

    /// Config file (default: $MQWS_CONFIG or mq2wsbridge.conf)
    #[arg(short = 'c', long)]
    config: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum View {
    Table,
    Graph,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let view = match (cli.visual, cli.graph) {
        (true, _) => Some(View::Table),
        (_, true) => Some(View::Graph),
        _ => None,
    };

    // Status lines would garble the live view.
    init_logging(&LogOptions {
        info: view.is_none(),
        ..LogOptions::default()
    })
    .context("Failed to install logger")?;

    let path = cli.config.clone().unwrap_or_else(get_config_path);
    let source = load_config(&path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let settings = apply_env_overrides(Settings::from_source(&source)?);
    validate_tester_settings(&settings)?;

    let broker = AmqpBroker::connect(&settings.broker, BridgeMetrics::new())
        .await
        .context("Is the broker reachable?")?;
    let gateway = Arc::new(QueueGateway::new(Arc::new(broker)));

    let engine = ReconciliationEngine::new(
        gateway.clone(),
        settings.broker.queue_to_socket.clone(),
        settings.broker.queue_from_socket.clone(),
    );
    let feed = engine.subscribe();
    let presenter = view.map(|view| tokio::spawn(present(engine.subscribe(), view)));

    let params = RunParams {
        num_messages: cli.number,
        delay_between: send_delay(cli.delay)?,
        end_delay: Duration::from_secs(cli.end_delay),
        exclusive: cli.exclusive,
        focused: cli.focused,
    };

    let outcome = tokio::select! {
        result = engine.run(&params) => result.map_err(anyhow::Error::from),
        _ = shutdown_signal() => {
            warn!("Interrupted; reporting what was seen so far");
            Ok(feed.borrow().clone())
        }
    };

    drop(engine);
    if let Some(presenter) = presenter {
        let _ = presenter.await;
    }
    if let Err(e) = gateway.close().await {
        warn!("Failed to close broker connection: {}", e);
    }

    let report = outcome.map_err(|e| {
        error!("Bridge Tester exited with errors: {}", e);
        e
    })?;

    if let Some(path) = &cli.report {
        report.write_unreconciled(path)?;
        info!("Unreconciled probes written to {}", path.display());
    }
    println!("{}", report.summary_line());
    Ok(())
}

/// Seconds between probes as a duration. Negative values mean no delay.
fn send_delay(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs.max(0.0))
        .with_context(|| format!("Invalid delay between messages: {}", secs))
}

fn terminal_size() -> (usize, usize) {
    let dim = |var: &str, default: usize| {
        std::env::var(var)
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(default)
    };
    (dim("COLUMNS", 80), dim("LINES", 24))
}

/// Redraw the chosen view on every report change until the run finishes.
async fn present(mut feed: watch::Receiver<ReconciliationReport>, view: View) {
    let (columns, lines) = terminal_size();
    // Header plus a status line.
    let rows = lines.saturating_sub(2).max(1);

    loop {
        let report = feed.borrow_and_update().clone();
        let frame = match view {
            View::Table => render_table(&report, rows),
            View::Graph => render_graph(&report, columns, rows),
        };

        draw(&frame, report.finished);

        if report.finished || feed.changed().await.is_err() {
            break;
        }
    }
}

fn draw(frame: &str, finished: bool) {
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "\x1b[2J\x1b[H{}", frame);
    if finished {
        let _ = writeln!(out, ">> All done testing, closing things out...");
    }
    let _ = out.flush();
}
