//! Service entrypoint
//!
//! Wires the full pipeline: node pool and fetcher, forward (and
//! optionally backward) ingest, live and history derivers, one async
//! worker per heavy processor with the holdings workers gated on the
//! token worker, the checkpoint committer, and the metrics listener.
//! Ctrl-C cancels everything cooperatively.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flowblox::async_worker::{AsyncWorker, AsyncWorkerConfig};
use flowblox::committer::CheckpointCommitter;
use flowblox::config;
use flowblox::fetcher::BlockFetcher;
use flowblox::history_deriver::{HistoryDeriver, HistoryDeriverConfig};
use flowblox::http_client::HttpNodeClient;
use flowblox::ingest::{IngestConfig, IngestService};
use flowblox::live_deriver::{LiveDeriver, LiveDeriverConfig};
use flowblox::memstore::MemoryRepository;
use flowblox::metrics;
use flowblox::node_client::NodeClient;
use flowblox::pool::PinnedPool;
use flowblox::processor::{self, ProcessorContext};
use flowblox::processors;
use flowblox::repository::{Repository, MAIN_INGESTER};
use flowblox::telemetry::{init_tracing, TelemetryConfig};

#[derive(Parser)]
#[command(name = "flowblox", about = "Chain indexing pipeline")]
struct Args {
    /// Config file (TOML, without extension for search paths)
    #[arg(long, default_value = "flowblox")]
    config: String,

    /// forward | full (forward + backward backfill)
    #[arg(long, default_value = "forward")]
    mode: String,

    /// Metrics/health listener address
    #[arg(long, default_value = "0.0.0.0:3005")]
    metrics_addr: SocketAddr,
}

/// Async worker set: (processor name, dependencies).
fn worker_plan() -> Vec<(&'static str, Vec<String>)> {
    let token_dep = vec![processor::TOKEN_WORKER.to_string()];
    vec![
        (processor::TOKEN_WORKER, vec![]),
        (processor::EVM_WORKER, vec![]),
        (processor::ACCOUNTS_WORKER, vec![]),
        (processor::META_WORKER, vec![]),
        (processor::FT_HOLDINGS_WORKER, token_dep.clone()),
        (processor::NFT_OWNERSHIP_WORKER, token_dep.clone()),
        (processor::DAILY_BALANCE_WORKER, token_dep.clone()),
        (processor::TX_CONTRACTS_WORKER, token_dep.clone()),
        (processor::STAKING_WORKER, vec![]),
        (processor::DEFI_WORKER, vec![]),
        (processor::DAILY_STATS_WORKER, vec![processor::META_WORKER.to_string()]),
        (processor::TOKEN_METADATA_WORKER, token_dep.clone()),
        (processor::NFT_RECONCILER_WORKER, token_dep),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    config::init_global_config(&args.config)?;
    init_tracing(TelemetryConfig::default())?;
    metrics::register_metrics();

    let endpoints = config::access_nodes();
    if endpoints.is_empty() {
        error!("no access nodes configured (flow.access_nodes / FLOW_ACCESS_NODES)");
        std::process::exit(1);
    }
    let mut clients: Vec<Arc<dyn NodeClient>> = Vec::new();
    for (index, endpoint) in endpoints.iter().enumerate() {
        clients.push(Arc::new(HttpNodeClient::new(endpoint.clone(), index)?));
    }
    info!(nodes = clients.len(), "access node pool ready");

    let pool = Arc::new(PinnedPool::new(clients));
    let fetcher = Arc::new(BlockFetcher::new(Arc::clone(&pool)));

    // The persistent store is pluggable; the built-in backend keeps
    // everything in process memory.
    warn!("using the in-memory store backend; indexed data will not survive a restart");
    let repository: Arc<dyn Repository> = Arc::new(MemoryRepository::new());

    let ctx = ProcessorContext::new(Arc::clone(&repository), Arc::clone(&pool));
    let registry = processors::build_registry(ctx);

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    // Metrics listener.
    {
        let cancel = cancel.clone();
        handles.push(tokio::spawn(metrics::run_metrics_server(
            args.metrics_addr,
            cancel,
        )));
    }

    // Live deriver, fed by the forward ingester.
    let live = Arc::new(LiveDeriver::new(
        registry.clone(),
        Arc::clone(&repository),
        LiveDeriverConfig::default(),
    ));
    {
        let live = Arc::clone(&live);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { live.run(cancel).await }));
    }

    // Forward ingestion.
    {
        let mut ingest_config = IngestConfig::forward(MAIN_INGESTER);
        ingest_config.start_block = config::get_global_config()
            .get_int("flow.start_block")
            .ok()
            .map(|h| h as u64);
        let notify = Arc::clone(&live);
        ingest_config.on_indexed_range = Some(Arc::new(move |from, to| {
            notify.notify_range(from, to);
        }));
        let service = IngestService::new(
            ingest_config,
            Arc::clone(&fetcher),
            Arc::clone(&pool),
            Arc::clone(&repository),
        );
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { service.run(cancel).await }));
    }

    // Backward backfill, full mode only.
    if args.mode == "full" {
        let start = config::get_global_config()
            .get_int("flow.backfill_start_block")
            .ok()
            .map(|h| h as u64);
        match start {
            Some(start_block) => {
                let service = IngestService::new(
                    IngestConfig::backward("backward_ingester", start_block),
                    Arc::clone(&fetcher),
                    Arc::clone(&pool),
                    Arc::clone(&repository),
                );
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move { service.run(cancel).await }));
            }
            None => warn!("full mode without flow.backfill_start_block; backward ingest disabled"),
        }
    }

    // Async workers.
    for (name, dependencies) in worker_plan() {
        let Some(worker_processor) = registry.get(name) else {
            continue;
        };
        let worker = AsyncWorker::new(
            worker_processor,
            Arc::clone(&repository),
            AsyncWorkerConfig {
                dependencies,
                ..Default::default()
            },
        );
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { worker.run(cancel).await }));
    }

    // History deriver.
    {
        let deriver = HistoryDeriver::new(
            registry.clone(),
            Arc::clone(&repository),
            HistoryDeriverConfig::default(),
        );
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { deriver.run(cancel).await }));
    }

    // Committer tracks every lease-based worker type.
    {
        let tracked: Vec<String> = worker_plan().into_iter().map(|(n, _)| n.to_string()).collect();
        let committer = CheckpointCommitter::new(Arc::clone(&repository), tracked);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { committer.run(cancel).await }));
    }

    info!("flowblox pipeline running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    cancel.cancel();

    for handle in handles {
        let _ = handle.await;
    }
    info!("flowblox stopped");
    Ok(())
}
