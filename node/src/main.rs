// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # DPoS Simulation Node
//!
//! Entry point for the `dpos-node` binary. Parses CLI arguments, initializes
//! logging and metrics, and starts one node or a whole simulated network.
//!
//! - `run`      - one node, dialing its peers on `base_port + id`
//! - `simulate` - every node of the network in this process
//! - `version`  - print build version information

mod cli;
mod logging;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use dpos_protocol::config::NodeConfig;
use dpos_protocol::network::{ForgingScheduler, LocalNode, Node};
use dpos_protocol::storage::Ledger;
use dpos_protocol::time::SlotClock;

use cli::{Commands, DposNodeCli, OutputArgs};
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DposNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Simulate(args) => simulate(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn init_logging(output: &OutputArgs) {
    logging::init_logging(&output.log_level, LogFormat::from_str_lossy(&output.log_format));
}

/// Runs a single node until Ctrl+C or SIGTERM.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    init_logging(&args.output);
    let config = args.network.resolve()?;
    if args.id >= config.number_of_peers {
        bail!(
            "node id {} is outside the network of {} peers",
            args.id,
            config.number_of_peers
        );
    }

    tracing::info!(
        node_id = args.id,
        listen = %config.listen_addr(args.id),
        peers = config.number_of_peers,
        delegates = config.number_of_delegates,
        "starting dpos-node"
    );

    let clock = SlotClock::system(config.epoch_ms, config.slot_duration_ms);
    let local = LocalNode::start(args.id, config, clock)
        .await
        .context("failed to start node")?;
    let node = Arc::clone(&local.node);

    let (stop_tx, stop_rx) = watch::channel(false);
    let metrics_task = match args.metrics_port {
        Some(port) => Some(serve_metrics(port, vec![Arc::clone(&node)], stop_rx.clone()).await?),
        None => None,
    };

    node.connect_peers().await;
    let forging = ForgingScheduler::spawn(&node);

    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    let _ = stop_tx.send(true);
    node.shutdown().await;
    join_quietly(forging, "forging loop").await;
    if let Some(task) = metrics_task {
        join_quietly(task, "metrics server").await;
    }

    tracing::info!(
        node_id = node.id,
        height = local.chain.height(),
        finalized = local.consensus.finalized_count(),
        "dpos-node stopped"
    );
    Ok(())
}

/// Runs every node of the network in this process.
async fn simulate(args: cli::SimulateArgs) -> Result<()> {
    init_logging(&args.output);
    let config = args.network.resolve()?;
    let clock = SlotClock::system(config.epoch_ms, config.slot_duration_ms);

    tracing::info!(
        peers = config.number_of_peers,
        delegates = config.number_of_delegates,
        base_port = config.base_port,
        "starting simulation"
    );

    let nodes = start_network(&config, &clock).await?;
    let handles: Vec<Arc<Node>> = nodes.iter().map(|l| Arc::clone(&l.node)).collect();

    let (stop_tx, stop_rx) = watch::channel(false);
    let metrics_task = match args.metrics_port {
        Some(port) => Some(serve_metrics(port, handles.clone(), stop_rx.clone()).await?),
        None => None,
    };

    // Give every listener time to come up before anyone dials.
    tokio::time::sleep(Duration::from_millis(args.bootstrap_delay_ms)).await;
    futures::future::join_all(handles.iter().map(|node| node.connect_peers())).await;

    let forging: Vec<JoinHandle<()>> = handles.iter().map(ForgingScheduler::spawn).collect();

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    tracing::info!(secs, "simulation time elapsed");
                }
                _ = shutdown_signal() => tracing::info!("shutdown signal received"),
            }
        }
        None => {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
        }
    }

    let _ = stop_tx.send(true);
    futures::future::join_all(handles.iter().map(|node| node.shutdown())).await;
    for task in forging {
        join_quietly(task, "forging loop").await;
    }
    if let Some(task) = metrics_task {
        join_quietly(task, "metrics server").await;
    }

    print_summary(&nodes)?;
    Ok(())
}

async fn start_network(config: &NodeConfig, clock: &SlotClock) -> Result<Vec<LocalNode>> {
    let mut nodes = Vec::with_capacity(config.number_of_peers as usize);
    for id in 0..config.number_of_peers {
        let local = LocalNode::start(id, config.clone(), clock.clone())
            .await
            .with_context(|| format!("failed to start node {id}"))?;
        nodes.push(local);
    }
    Ok(nodes)
}

/// Binds the metrics endpoint and starts sampling `nodes`.
async fn serve_metrics(
    port: u16,
    nodes: Vec<Arc<Node>>,
    stop: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to create metrics registry")?);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    tracing::info!(%addr, "metrics server listening");

    let sampler = tokio::spawn(metrics::sample_loop(Arc::clone(&node_metrics), nodes, stop.clone()));
    let router = metrics::router(node_metrics);

    Ok(tokio::spawn(async move {
        let mut stop = stop;
        let graceful = async move {
            let _ = stop.wait_for(|&stopped| stopped).await;
        };
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(graceful).await {
            tracing::error!(error = %e, "metrics server error");
        }
        join_quietly(sampler, "metrics sampler").await;
    }))
}

async fn join_quietly(task: JoinHandle<()>, what: &str) {
    if let Err(e) = task.await {
        tracing::warn!(task = what, error = %e, "task ended abnormally");
    }
}

/// Prints one JSON line per node with its chain tip and counters.
fn print_summary(nodes: &[LocalNode]) -> Result<()> {
    for local in nodes {
        let tip = local.chain.get_last_block();
        let line = serde_json::json!({
            "node": local.node.id,
            "height": local.chain.height(),
            "tip": tip.hash_hex(),
            "finalized": local.consensus.finalized_count(),
            "peers": local.node.registry().ids(),
            "stats": local.node.stats(),
        });
        println!("{}", serde_json::to_string(&line).context("failed to encode summary")?);
    }
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("dpos-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc     {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
