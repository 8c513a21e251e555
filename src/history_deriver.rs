//! History deriver
//!
//! Fills the derivation gap between the async-worker floor and the
//! oldest raw block, and follows backward ingestion as it extends
//! history downward. Two cursors, both stored as checkpoints: the up
//! cursor scans from the initial raw minimum toward the lowest
//! async-worker checkpoint; the down cursor starts where the up cursor
//! started and descends as older blocks appear.
//!
//! Chunks dispatch concurrently, but a cursor only advances across a
//! contiguous prefix of successful chunks, so a mid-range failure
//! cannot open a silent hole.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::BoxError;
use crate::processor::{
    ProcessorRegistry, ACCOUNTS_WORKER, EVM_WORKER, META_WORKER, TOKEN_WORKER,
};
use crate::repository::Repository;

/// Up-cursor checkpoint name.
pub const UP_CURSOR: &str = "history_deriver";
/// Down-cursor checkpoint name.
pub const DOWN_CURSOR: &str = "history_deriver_down";

/// The async workers whose lowest checkpoint caps upward scanning.
const WORKER_FLOOR_SOURCES: &[&str] =
    &[TOKEN_WORKER, EVM_WORKER, ACCOUNTS_WORKER, META_WORKER];

const MAX_DEADLOCK_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct HistoryDeriverConfig {
    pub chunk_size: u64,
    /// Chunks dispatched concurrently per cycle.
    pub concurrency: usize,
    /// Pause between productive cycles.
    pub sleep: Duration,
    /// Pause when there is nothing to do.
    pub idle_sleep: Duration,
    /// Base for the linear deadlock backoff.
    pub deadlock_backoff: Duration,
}

impl Default for HistoryDeriverConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            concurrency: 4,
            sleep: Duration::from_millis(500),
            idle_sleep: Duration::from_secs(5),
            deadlock_backoff: Duration::from_secs(1),
        }
    }
}

pub struct HistoryDeriver {
    registry: ProcessorRegistry,
    repository: Arc<dyn Repository>,
    config: HistoryDeriverConfig,
}

impl HistoryDeriver {
    pub fn new(
        registry: ProcessorRegistry,
        repository: Arc<dyn Repository>,
        config: HistoryDeriverConfig,
    ) -> Self {
        Self {
            registry,
            repository,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            chunk_size = self.config.chunk_size,
            concurrency = self.config.concurrency,
            "history deriver starting"
        );
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let sleep = match self.cycle(&cancel).await {
                Ok(true) => self.config.sleep,
                Ok(false) => self.config.idle_sleep,
                Err(e) => {
                    error!(error = %e, "history deriver cycle failed");
                    self.config.idle_sleep
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// One cycle: try upward chunks first, then downward. Returns
    /// whether any cursor moved.
    pub async fn cycle(&self, cancel: &CancellationToken) -> Result<bool, BoxError> {
        let Some(block_range) = self.repository.get_block_range().await? else {
            return Ok(false);
        };

        // Initialize both cursors from the raw minimum on first run.
        let up = match self.repository.get_last_indexed_height(UP_CURSOR).await? {
            Some(h) => h,
            None => {
                let initial = block_range.min_height;
                self.repository.update_checkpoint(UP_CURSOR, initial).await?;
                initial
            }
        };
        let down = match self.repository.get_last_indexed_height(DOWN_CURSOR).await? {
            Some(h) => h,
            None => {
                self.repository.update_checkpoint(DOWN_CURSOR, up).await?;
                up
            }
        };

        if self.advance_upward(up, cancel).await? {
            return Ok(true);
        }
        self.advance_downward(down, block_range.min_height, cancel).await
    }

    /// Lowest checkpoint among the async workers feeding the same
    /// tables; scanning past it would derive from raw rows the workers
    /// have not been near yet.
    async fn worker_floor(&self) -> Result<u64, BoxError> {
        let mut floor = u64::MAX;
        for source in WORKER_FLOOR_SOURCES {
            let checkpoint = self
                .repository
                .get_last_indexed_height(source)
                .await?
                .unwrap_or(0);
            floor = floor.min(checkpoint);
        }
        Ok(if floor == u64::MAX { 0 } else { floor })
    }

    async fn advance_upward(&self, up: u64, cancel: &CancellationToken) -> Result<bool, BoxError> {
        let floor = self.worker_floor().await?;

        let mut chunks: Vec<(u64, u64)> = Vec::new();
        let mut cursor = up;
        while chunks.len() < self.config.concurrency {
            let to = cursor + self.config.chunk_size;
            if to > floor {
                break;
            }
            chunks.push((cursor, to));
            cursor = to;
        }
        let Some(&(first_from, first_to)) = chunks.first() else {
            return Ok(false);
        };
        if !self.repository.has_blocks_in_range(first_from, first_to).await? {
            debug!(from = first_from, "upward gate: raw blocks not present yet");
            return Ok(false);
        }

        let outcomes = self.dispatch(&chunks, cancel).await;

        // Contiguous-prefix advancement.
        let mut new_up = up;
        for ((_, to), ok) in chunks.iter().zip(&outcomes) {
            if *ok {
                new_up = *to;
            } else {
                break;
            }
        }
        if new_up > up {
            self.repository.update_checkpoint(UP_CURSOR, new_up).await?;
            info!(from = up, to = new_up, "history deriver advanced upward");
            return Ok(true);
        }
        Ok(false)
    }

    async fn advance_downward(
        &self,
        down: u64,
        min_raw: u64,
        cancel: &CancellationToken,
    ) -> Result<bool, BoxError> {
        if down <= min_raw {
            return Ok(false);
        }

        let mut chunks: Vec<(u64, u64)> = Vec::new();
        let mut cursor = down;
        while chunks.len() < self.config.concurrency && cursor > min_raw {
            let from = cursor.saturating_sub(self.config.chunk_size).max(min_raw);
            chunks.push((from, cursor));
            cursor = from;
        }
        let Some(&(first_from, first_to)) = chunks.first() else {
            return Ok(false);
        };
        if !self.repository.has_blocks_in_range(first_from, first_to).await? {
            debug!(from = first_from, "downward gate: raw blocks not present yet");
            return Ok(false);
        }

        let outcomes = self.dispatch(&chunks, cancel).await;

        let mut new_down = down;
        for ((from, _), ok) in chunks.iter().zip(&outcomes) {
            if *ok {
                new_down = *from;
            } else {
                break;
            }
        }
        if new_down < down {
            self.repository.update_checkpoint(DOWN_CURSOR, new_down).await?;
            info!(from = new_down, to = down, "history deriver advanced downward");
            return Ok(true);
        }
        Ok(false)
    }

    /// Run the chunk list concurrently; each chunk re-verifies its raw
    /// coverage before running.
    async fn dispatch(&self, chunks: &[(u64, u64)], cancel: &CancellationToken) -> Vec<bool> {
        let runs = chunks.iter().map(|(from, to)| {
            let (from, to) = (*from, *to);
            async move {
                match self.repository.has_blocks_in_range(from, to).await {
                    Ok(true) => self.run_chunk(from, to, cancel).await,
                    _ => false,
                }
            }
        });
        futures::future::join_all(runs).await
    }

    /// Two-phase processor run over one chunk, with deadlock retry:
    /// concurrent upserts into shared tables can deadlock, so each
    /// processor gets up to three attempts with linear backoff. The
    /// chunk succeeds only if every processor does.
    async fn run_chunk(&self, from: u64, to: u64, cancel: &CancellationToken) -> bool {
        let (phase_one, phase_two) = self.registry.phases();
        for phase in [phase_one, phase_two] {
            let runs = phase.iter().map(|processor| {
                let processor = Arc::clone(processor);
                async move {
                    let name = processor.name();
                    for attempt in 1..=MAX_DEADLOCK_RETRIES {
                        match processor.process_range(from, to, cancel).await {
                            Ok(()) => return true,
                            Err(e) => {
                                let deadlock = e.to_string().to_lowercase().contains("deadlock");
                                if deadlock && attempt < MAX_DEADLOCK_RETRIES {
                                    warn!(
                                        processor = name,
                                        from, attempt, "deadlock, retrying chunk"
                                    );
                                    tokio::time::sleep(self.config.deadlock_backoff * attempt)
                                        .await;
                                    continue;
                                }
                                warn!(processor = name, from, to, error = %e, "history chunk failed");
                                return false;
                            }
                        }
                    }
                    false
                }
            });
            let results = futures::future::join_all(runs).await;
            if results.iter().any(|ok| !ok) {
                return false;
            }
        }
        true
    }
}
