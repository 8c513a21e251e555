//! Ingest service
//!
//! Drives a contiguous height sequence through the block fetcher and
//! into the raw tables, one batch per cycle. Forward mode follows the
//! chain tip, checks parent continuity against what is already stored
//! and rolls back on reorg; backward mode backfills history until it
//! reaches genesis or a spork floor. Each committed range is announced
//! through `on_indexed_range` so the derivation engines can follow.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::address::is_system_transaction;
use crate::error::{BoxError, IndexingErrorKind};
use crate::fetcher::BlockFetcher;
use crate::metrics;
use crate::pool::PinnedPool;
use crate::repository::Repository;
use crate::types::{Block, Event, FetchResult, Transaction};

pub type BlockCallback = Arc<dyn Fn(&Block) + Send + Sync>;
pub type TxCallback = Arc<dyn Fn(&Transaction) + Send + Sync>;
pub type RangeCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    Forward,
    Backward,
}

#[derive(Clone)]
pub struct IngestConfig {
    pub batch_size: u64,
    pub worker_count: usize,
    pub service_name: String,
    pub start_block: Option<u64>,
    pub mode: IngestMode,
    pub max_reorg_depth: u64,
    pub on_new_block: Option<BlockCallback>,
    pub on_new_tx: Option<TxCallback>,
    pub on_indexed_range: Option<RangeCallback>,
}

impl IngestConfig {
    pub fn forward(service_name: impl Into<String>) -> Self {
        Self {
            batch_size: 20,
            worker_count: 8,
            service_name: service_name.into(),
            start_block: None,
            mode: IngestMode::Forward,
            max_reorg_depth: 100,
            on_new_block: None,
            on_new_tx: None,
            on_indexed_range: None,
        }
    }

    pub fn backward(service_name: impl Into<String>, start_block: u64) -> Self {
        Self {
            batch_size: 20,
            worker_count: 8,
            service_name: service_name.into(),
            start_block: Some(start_block),
            mode: IngestMode::Backward,
            max_reorg_depth: 100,
            on_new_block: None,
            on_new_tx: None,
            on_indexed_range: None,
        }
    }
}

/// Outcome of one ingest cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to do right now.
    Idle,
    /// Committed `[from, to]` (inclusive).
    Indexed { from: u64, to: u64 },
    /// Terminal for this service (backward reached the floor).
    Stop,
}

pub struct IngestService {
    config: IngestConfig,
    fetcher: Arc<BlockFetcher>,
    pool: Arc<PinnedPool>,
    repository: Arc<dyn Repository>,
    /// Raised when backward ingestion hits a spork root.
    spork_floor: Mutex<Option<u64>>,
}

/// Shrink batches near the tip so freshly sealed blocks land with
/// minimum latency instead of waiting to fill a batch.
pub fn adaptive_batch_size(gap: u64, configured: u64) -> u64 {
    match gap {
        0 => 1,
        g if g <= 3 => 1,
        g if g <= 20 => configured.min(5),
        g if g <= 100 => configured.min(10),
        _ => configured,
    }
}

impl IngestService {
    pub fn new(
        config: IngestConfig,
        fetcher: Arc<BlockFetcher>,
        pool: Arc<PinnedPool>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        Self {
            config,
            fetcher,
            pool,
            repository,
            spork_floor: Mutex::new(None),
        }
    }

    /// Main loop: run cycles until cancelled or the service stops.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            service = %self.config.service_name,
            mode = ?self.config.mode,
            "ingest service starting"
        );
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let sleep = match self.run_cycle(&cancel).await {
                Ok(CycleOutcome::Indexed { from, to }) => {
                    info!(
                        service = %self.config.service_name,
                        from, to, "indexed range"
                    );
                    Duration::from_millis(200)
                }
                Ok(CycleOutcome::Idle) => Duration::from_secs(2),
                Ok(CycleOutcome::Stop) => {
                    info!(service = %self.config.service_name, "ingest service done");
                    return;
                }
                Err(e) => {
                    error!(service = %self.config.service_name, error = %e, "ingest cycle failed");
                    Duration::from_secs(10)
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// One batch: plan the range, fetch, check continuity, commit.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleOutcome, BoxError> {
        match self.config.mode {
            IngestMode::Forward => self.run_forward_cycle(cancel).await,
            IngestMode::Backward => self.run_backward_cycle(cancel).await,
        }
    }

    async fn run_forward_cycle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, BoxError> {
        let last_indexed = self
            .repository
            .get_last_indexed_height(&self.config.service_name)
            .await?;
        let latest = self.pool.get_latest_block_height(cancel).await?;
        metrics::CHAIN_TIP_HEIGHT
            .with_label_values(&["remote"])
            .set(latest as i64);

        let start = match (last_indexed, self.config.start_block) {
            (Some(h), _) => h + 1,
            (None, Some(s)) => s,
            (None, None) => latest.saturating_sub(100),
        };
        if start > latest {
            return Ok(CycleOutcome::Idle);
        }

        let batch = adaptive_batch_size(latest - start, self.config.batch_size);
        let end = (start + batch - 1).min(latest);

        let results = self.fetch_batch_parallel(start, end, cancel).await?;
        let fetched: Vec<&FetchResult> = results.iter().filter_map(|(_, r)| r.as_ref()).collect();
        if fetched.is_empty() {
            return Ok(CycleOutcome::Idle);
        }

        // Parent continuity: lowest against the store, the rest within
        // the batch (only across adjacent heights; a skipped height
        // breaks the chain without implying a reorg).
        let lowest = fetched[0];
        if lowest.block.height > 0 {
            if let Some(stored_parent) = self
                .repository
                .get_block_id_by_height(lowest.block.height - 1)
                .await?
            {
                if stored_parent != lowest.block.parent_id {
                    return self
                        .handle_reorg(lowest.block.height - 1, last_indexed.unwrap_or(0))
                        .await;
                }
            }
        }
        for pair in fetched.windows(2) {
            if pair[1].block.height == pair[0].block.height + 1
                && pair[1].block.parent_id != pair[0].block.id
            {
                return self
                    .handle_reorg(pair[0].block.height, last_indexed.unwrap_or(0))
                    .await;
            }
        }

        self.commit_batch(&results, end).await?;

        if let Some(cb) = &self.config.on_indexed_range {
            cb(start, end + 1);
        }
        for (_, result) in &results {
            let Some(result) = result else { continue };
            if let Some(cb) = &self.config.on_new_block {
                cb(&result.block);
            }
            if let Some(cb) = &self.config.on_new_tx {
                for tx in &result.transactions {
                    if !is_system_transaction(&tx.proposer, &tx.payer) {
                        cb(tx);
                    }
                }
            }
        }

        metrics::CHAIN_TIP_HEIGHT
            .with_label_values(&["indexed"])
            .set(end as i64);
        Ok(CycleOutcome::Indexed { from: start, to: end })
    }

    async fn run_backward_cycle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, BoxError> {
        let last_indexed = self
            .repository
            .get_last_indexed_height(&self.config.service_name)
            .await?;
        let current_tip = match last_indexed.or(self.config.start_block) {
            Some(t) => t,
            None => return Ok(CycleOutcome::Stop),
        };
        if current_tip <= 1 {
            return Ok(CycleOutcome::Stop);
        }

        let end = current_tip - 1;
        let mut start = end.saturating_sub(self.config.batch_size - 1);
        if let Some(floor) = *self.spork_floor.lock().unwrap() {
            if end < floor {
                info!(
                    service = %self.config.service_name,
                    floor, "backward ingestion reached spork floor"
                );
                return Ok(CycleOutcome::Stop);
            }
            start = start.max(floor);
        }

        let results = match self.fetch_batch_parallel(start, end, cancel).await {
            Ok(r) => r,
            Err(e) => {
                // A spork boundary tells us where history ends on the
                // available fleet; clamp and let the next cycle retry.
                if let Some(node_err) = e.downcast_ref::<crate::error::NodeError>() {
                    if node_err.indicates_spork_boundary() {
                        if let Some(root) = node_err.spork_root_height() {
                            let mut floor = self.spork_floor.lock().unwrap();
                            *floor = Some(floor.map_or(root, |f| f.max(root)));
                            info!(root, "backward ingestion learned spork floor");
                        }
                    }
                }
                return Err(e);
            }
        };
        if results.iter().all(|(_, r)| r.is_none()) {
            return Ok(CycleOutcome::Idle);
        }

        // Half-open semantics: "processed down through start".
        self.commit_batch(&results, start).await?;

        if let Some(cb) = &self.config.on_indexed_range {
            cb(start, end + 1);
        }
        Ok(CycleOutcome::Indexed { from: start, to: end })
    }

    /// Fetch `[start, end]` concurrently, one fetcher task per height
    /// under the worker bound. Spork-boundary errors propagate so the
    /// backward path can learn the floor; any other per-height failure
    /// skips that height with a logged warning.
    async fn fetch_batch_parallel(
        &self,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<(u64, Option<FetchResult>)>, BoxError> {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count));
        let fetches: Vec<_> = (start..=end)
            .map(|height| {
                let sem = Arc::clone(&semaphore);
                let fetcher = Arc::clone(&self.fetcher);
                async move {
                    let _permit = sem.acquire().await;
                    (height, fetcher.fetch_block_data(height, cancel).await)
                }
            })
            .collect();

        let mut out = Vec::with_capacity((end - start + 1) as usize);
        for (height, result) in futures::future::join_all(fetches).await {
            match result {
                Ok(r) => out.push((height, Some(r))),
                Err(e) if e.indicates_spork_boundary() => {
                    return Err(Box::new(e));
                }
                Err(crate::error::NodeError::Cancelled) => {
                    return Err(Box::new(crate::error::NodeError::Cancelled));
                }
                Err(e) => {
                    warn!(height, error = %e, "skipping unfetchable height");
                    self.repository
                        .log_indexing_error(
                            &self.config.service_name,
                            height,
                            IndexingErrorKind::IngestWarning.as_str(),
                            &format!("height skipped: {}", e),
                        )
                        .await?;
                    out.push((height, None));
                }
            }
        }
        Ok(out)
    }

    /// Persist one batch atomically and log its fetch warnings.
    async fn commit_batch(
        &self,
        results: &[(u64, Option<FetchResult>)],
        checkpoint: u64,
    ) -> Result<(), BoxError> {
        let mut blocks: Vec<Block> = Vec::new();
        let mut transactions: Vec<Transaction> = Vec::new();
        let mut events: Vec<Event> = Vec::new();
        for (_, result) in results {
            let Some(result) = result else { continue };
            blocks.push(result.block.clone());
            transactions.extend(result.transactions.iter().cloned());
            events.extend(result.events.iter().cloned());
        }
        blocks.sort_by_key(|b| b.height);

        self.repository
            .save_batch(
                &blocks,
                &transactions,
                &events,
                &self.config.service_name,
                checkpoint,
            )
            .await?;

        metrics::BLOCKS_INDEXED
            .with_label_values(&[self.config.service_name.as_str()])
            .inc_by(blocks.len() as u64);
        metrics::TRANSACTIONS_INDEXED.inc_by(transactions.len() as u64);

        for (height, result) in results {
            let Some(result) = result else { continue };
            for warning in &result.warnings {
                self.repository
                    .log_indexing_error(
                        &self.config.service_name,
                        *height,
                        IndexingErrorKind::FetchWarning.as_str(),
                        &warning.message,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Reorg within depth: roll the store back and let the next cycle
    /// re-ingest. Deeper than `max_reorg_depth` is an operator problem.
    async fn handle_reorg(
        &self,
        rollback_height: u64,
        last_indexed: u64,
    ) -> Result<CycleOutcome, BoxError> {
        let depth = last_indexed.saturating_sub(rollback_height);
        if depth > self.config.max_reorg_depth {
            error!(
                rollback_height,
                depth,
                max = self.config.max_reorg_depth,
                "reorg deeper than maximum; refusing to rollback"
            );
            return Err(format!(
                "reorg at height {} deeper than max depth {}",
                rollback_height, self.config.max_reorg_depth
            )
            .into());
        }
        info!(rollback_height, depth, "reorg detected, rolling back");
        self.repository.rollback_from_height(rollback_height).await?;
        metrics::REORGS_HANDLED.inc();
        Err(format!("reorg rolled back to height {}; retrying", rollback_height).into())
    }
}
