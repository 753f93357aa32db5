//! # Prometheus Metrics
//!
//! Exposes per-node counters at `/metrics`. The library keeps plain atomic
//! counters; a sampler task copies them into labelled gauges once per
//! interval, so one registry covers every node in a simulation.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::sync::watch;

use dpos_protocol::network::Node;
use dpos_protocol::stats::StatsSnapshot;

/// How often node counters are copied into the registry.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Prometheus handles, labelled by `node`.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub blocks_forged: IntGaugeVec,
    pub blocks_relayed: IntGaugeVec,
    pub blocks_rejected: IntGaugeVec,
    pub blocks_duplicate: IntGaugeVec,
    pub stage_messages: IntGaugeVec,
    pub send_failures: IntGaugeVec,
    pub dial_failures: IntGaugeVec,
    pub peers_pruned: IntGaugeVec,
    pub connected_peers: IntGaugeVec,
    pub chain_height: IntGaugeVec,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("dpos".into()), None)?;
        let gauge = |name: &str, help: &str| -> Result<IntGaugeVec, prometheus::Error> {
            let vec = IntGaugeVec::new(Opts::new(name, help), &["node"])?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        Ok(Self {
            blocks_forged: gauge("blocks_forged_total", "Blocks forged by this node")?,
            blocks_relayed: gauge("blocks_relayed_total", "Received blocks accepted and relayed")?,
            blocks_rejected: gauge("blocks_rejected_total", "Received blocks that failed validation")?,
            blocks_duplicate: gauge("blocks_duplicate_total", "Received blocks already held")?,
            stage_messages: gauge("stage_messages_total", "Consensus stage messages received")?,
            send_failures: gauge("send_failures_total", "Peer sends that exhausted their retries")?,
            dial_failures: gauge("dial_failures_total", "Peers that could not be dialed")?,
            peers_pruned: gauge("peers_pruned_total", "Peers removed after repeated failures")?,
            connected_peers: gauge("connected_peers", "Peers currently in the registry")?,
            chain_height: gauge("chain_height", "Height of the committed chain tip")?,
            registry: registry.clone(),
        })
    }

    /// Copies one node's counters into the gauges.
    pub fn observe(&self, node: &Node) {
        let label = node.id.to_string();
        let labels = [label.as_str()];
        let stats: StatsSnapshot = node.stats();
        let set = |vec: &IntGaugeVec, value: u64| {
            vec.with_label_values(&labels).set(i64::try_from(value).unwrap_or(i64::MAX));
        };

        set(&self.blocks_forged, stats.blocks_forged);
        set(&self.blocks_relayed, stats.blocks_relayed);
        set(&self.blocks_rejected, stats.blocks_rejected);
        set(&self.blocks_duplicate, stats.blocks_duplicate);
        set(&self.stage_messages, stats.stage_messages);
        set(&self.send_failures, stats.send_failures);
        set(&self.dial_failures, stats.dial_failures);
        set(&self.peers_pruned, stats.peers_pruned);
        set(&self.connected_peers, node.registry().len() as u64);
        set(&self.chain_height, node.chain().get_last_block().height);
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Samples `nodes` every [`SAMPLE_INTERVAL`] until `shutdown` flips.
pub async fn sample_loop(metrics: SharedMetrics, nodes: Vec<Arc<Node>>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for node in &nodes {
                    metrics.observe(node);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

/// Router serving `/metrics`.
pub fn router(metrics: SharedMetrics) -> axum::Router {
    axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .with_state(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpos_protocol::config::NodeConfig;
    use dpos_protocol::consensus::ConsensusEngine;
    use dpos_protocol::network::StageMessage;
    use dpos_protocol::storage::{Block, Blockchain};
    use dpos_protocol::time::{Slot, SlotClock};

    struct Idle;

    impl ConsensusEngine for Idle {
        fn add_block(&self, _block: &Block, _slot: Slot) {}
        fn process_stage_message(&self, _msg: StageMessage) {}
    }

    #[test]
    fn observed_node_appears_in_output() {
        let metrics = NodeMetrics::new().unwrap();
        let clock = SlotClock::system(0, 1_000);
        let chain = Arc::new(Blockchain::new(4, clock.clone(), 1));
        let node = Node::new(4, NodeConfig::default(), chain, Arc::new(Idle), clock);

        metrics.observe(&node);
        let body = metrics.encode().unwrap();
        assert!(body.contains("dpos_chain_height{node=\"4\"} 0"));
        assert!(body.contains("dpos_connected_peers{node=\"4\"} 0"));
    }
}
