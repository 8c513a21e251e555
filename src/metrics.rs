//! Prometheus instrumentation
//!
//! One global registry with the pipeline's counters, gauges and
//! histograms, plus the tiny HTTP exposition surface (/metrics,
//! /healthz).

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Standard latency buckets for histograms (seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Ingestion

    /// Blocks persisted, by service ("main_ingester", "backward_ingester")
    pub static ref BLOCKS_INDEXED: IntCounterVec = IntCounterVec::new(
        Opts::new("flowblox_blocks_indexed_total", "Blocks persisted by ingest service"),
        &["service"]
    ).unwrap();

    /// Transactions persisted
    pub static ref TRANSACTIONS_INDEXED: IntCounter = IntCounter::new(
        "flowblox_transactions_indexed_total",
        "Transactions persisted by ingest services"
    ).unwrap();

    /// Chain tip height by source (remote, indexed)
    pub static ref CHAIN_TIP_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("flowblox_chain_tip_height", "Chain tip height by source"),
        &["source"]
    ).unwrap();

    /// Reorg rollbacks performed
    pub static ref REORGS_HANDLED: IntCounter = IntCounter::new(
        "flowblox_reorgs_handled_total",
        "Reorg rollbacks performed by the forward ingester"
    ).unwrap();

    // Fetch layer

    /// Repins per cause (unavailable, spork_root, exhausted)
    pub static ref FETCH_REPINS: IntCounterVec = IntCounterVec::new(
        Opts::new("flowblox_fetch_repins_total", "Node repins by cause"),
        &["cause"]
    ).unwrap();

    /// Fallback ladder activations (per_collection, per_tx, raw_bulk, raw_per_tx, synthesized)
    pub static ref FETCH_FALLBACKS: IntCounterVec = IntCounterVec::new(
        Opts::new("flowblox_fetch_fallbacks_total", "Fetch fallback ladder activations"),
        &["path"]
    ).unwrap();

    /// Block fetch latency
    pub static ref FETCH_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("flowblox_fetch_duration_seconds", "Full block fetch latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    // Derivation

    /// Processor run durations, by processor
    pub static ref PROCESSOR_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("flowblox_processor_duration_seconds", "ProcessRange latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["processor"]
    ).unwrap();

    /// Processor failures, by processor and engine
    pub static ref PROCESSOR_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("flowblox_processor_failures_total", "ProcessRange failures"),
        &["processor", "engine"]
    ).unwrap();

    /// Checkpoint height per worker type
    pub static ref CHECKPOINT_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("flowblox_checkpoint_height", "Checkpoint height per worker type"),
        &["worker"]
    ).unwrap();

    /// Lease transitions (acquired, reclaimed, completed, failed, reaped)
    pub static ref LEASE_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("flowblox_lease_events_total", "Lease lifecycle transitions"),
        &["event"]
    ).unwrap();

    /// Dead leases currently blocking progress
    pub static ref DEAD_LEASES: IntGauge = IntGauge::new(
        "flowblox_dead_leases",
        "Leases with attempt >= 20 blocking checkpoint advancement"
    ).unwrap();

    /// Live deriver retry queue depth
    pub static ref RETRY_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "flowblox_live_retry_queue_depth",
        "Live deriver retry queue depth"
    ).unwrap();

    /// Repair ranges rerun
    pub static ref REPAIR_RANGES: IntCounter = IntCounter::new(
        "flowblox_repair_ranges_total",
        "Failed ranges rerun by the repair loop"
    ).unwrap();
}

/// Register all metrics with the global registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(BLOCKS_INDEXED.clone()),
        Box::new(TRANSACTIONS_INDEXED.clone()),
        Box::new(CHAIN_TIP_HEIGHT.clone()),
        Box::new(REORGS_HANDLED.clone()),
        Box::new(FETCH_REPINS.clone()),
        Box::new(FETCH_FALLBACKS.clone()),
        Box::new(FETCH_DURATION.clone()),
        Box::new(PROCESSOR_DURATION.clone()),
        Box::new(PROCESSOR_FAILURES.clone()),
        Box::new(CHECKPOINT_HEIGHT.clone()),
        Box::new(LEASE_EVENTS.clone()),
        Box::new(DEAD_LEASES.clone()),
        Box::new(RETRY_QUEUE_DEPTH.clone()),
        Box::new(REPAIR_RANGES.clone()),
    ];
    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            // Double registration only happens in tests; ignore.
            tracing::debug!("metric registration skipped: {}", e);
        }
    }
}

/// Render the registry in the Prometheus text exposition format.
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn metrics_handler() -> String {
    render_metrics()
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Serve /metrics and /healthz until cancelled.
pub async fn run_metrics_server(addr: SocketAddr, cancel: CancellationToken) {
    use axum::{routing::get, Router};
    use tower_http::cors::{Any, CorsLayer};

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .layer(cors);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind metrics listener on {}: {}", addr, e);
            return;
        }
    };
    info!("metrics listening on {}", addr);

    let shutdown = cancel.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown.cancelled().await;
    });
    if let Err(e) = server.await {
        error!("metrics server failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metric() {
        register_metrics();
        BLOCKS_INDEXED.with_label_values(&["main_ingester"]).inc();
        let text = render_metrics();
        assert!(text.contains("flowblox_blocks_indexed_total"));
    }
}
