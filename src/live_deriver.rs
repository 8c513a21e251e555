//! Live deriver
//!
//! Minimum-latency derivation at the chain head. The ingester posts
//! freshly committed ranges into a single coalesced pending slot; the
//! run loop drains it in small chunks, running processors in two
//! phases (transfer-builder consumers second), each under its own
//! timeout. A failed processor never blocks the others: its failure is
//! logged, queued for bounded retry, and ultimately handed to the
//! repair loop, which periodically re-runs processors over the block
//! heights logged as failed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config;
use crate::error::{BoxError, IndexingErrorKind};
use crate::metrics;
use crate::processor::{Processor, ProcessorRegistry, SERIALIZED_REPAIR_WORKERS};
use crate::repository::Repository;

/// Retry bookkeeping for one failed (processor, chunk).
#[derive(Debug, Clone)]
struct RetryItem {
    processor: String,
    from: u64,
    to: u64,
    attempt: u32,
    due_at: Instant,
}

const RETRY_QUEUE_CAP: usize = 100;
const MAX_LIVE_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(5);

/// Heights this close together repair as one range.
const REPAIR_MAX_GAP: u64 = 100;

#[derive(Clone)]
pub struct LiveDeriverConfig {
    pub chunk_size: u64,
    pub processor_timeout: Duration,
    /// Secondary instances disable the repair loop.
    pub disable_repair: bool,
}

impl Default for LiveDeriverConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            processor_timeout: Duration::from_millis(config::live_processor_timeout_ms()),
            disable_repair: false,
        }
    }
}

pub struct LiveDeriver {
    registry: ProcessorRegistry,
    repository: Arc<dyn Repository>,
    config: LiveDeriverConfig,
    /// Coalesced [from, to) awaiting derivation.
    pending: Mutex<Option<(u64, u64)>>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    retry_queue: Mutex<VecDeque<RetryItem>>,
}

impl LiveDeriver {
    pub fn new(
        registry: ProcessorRegistry,
        repository: Arc<dyn Repository>,
        config: LiveDeriverConfig,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self {
            registry,
            repository,
            config,
            pending: Mutex::new(None),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            retry_queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Edge-triggered, coalescing notification from the ingester.
    /// Never blocks: overlapping ranges merge into one pending slot
    /// and the single-capacity wake channel absorbs bursts.
    pub fn notify_range(&self, from: u64, to: u64) {
        {
            let mut pending = self.pending.lock().unwrap();
            *pending = match *pending {
                Some((f, t)) => Some((f.min(from), t.max(to))),
                None => Some((from, to)),
            };
        }
        let _ = self.wake_tx.try_send(());
    }

    pub fn pending_range(&self) -> Option<(u64, u64)> {
        *self.pending.lock().unwrap()
    }

    /// Main loop: wake on notification or every 5s for retries.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(chunk_size = self.config.chunk_size, "live deriver starting");
        let mut wake_rx = self
            .wake_rx
            .lock()
            .unwrap()
            .take()
            .expect("live deriver run() started twice");

        if !self.config.disable_repair {
            let repair = Arc::clone(&self);
            let repair_cancel = cancel.clone();
            tokio::spawn(async move { repair.run_repair(repair_cancel).await });
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = wake_rx.recv() => {}
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            }
            self.drain_pending(&cancel).await;
            self.process_due_retries(&cancel).await;
        }
    }

    /// Take and process whatever range has accumulated.
    pub async fn drain_pending(&self, cancel: &CancellationToken) {
        let taken = self.pending.lock().unwrap().take();
        let Some((from, to)) = taken else { return };
        debug!(from, to, "live deriver draining");

        let mut chunk_from = from;
        while chunk_from < to {
            if cancel.is_cancelled() {
                return;
            }
            let chunk_to = (chunk_from + self.config.chunk_size).min(to);
            self.run_chunk(chunk_from, chunk_to, cancel).await;
            chunk_from = chunk_to;
        }
    }

    /// Run both processor phases over one chunk. Successful processors
    /// get their checkpoint advanced to the chunk end; failures are
    /// logged and queued for retry without blocking anyone else.
    pub async fn run_chunk(&self, from: u64, to: u64, cancel: &CancellationToken) {
        let (phase_one, phase_two) = self.registry.phases();
        let mut succeeded: Vec<&'static str> = Vec::new();

        for phase in [phase_one, phase_two] {
            let runs = phase.iter().map(|processor| {
                let processor = Arc::clone(processor);
                async move {
                    let name = processor.name();
                    let timer = metrics::PROCESSOR_DURATION
                        .with_label_values(&[name])
                        .start_timer();
                    let outcome = tokio::time::timeout(
                        self.config.processor_timeout,
                        processor.process_range(from, to, cancel),
                    )
                    .await;
                    timer.observe_duration();
                    let result: Result<(), BoxError> = match outcome {
                        Ok(r) => r,
                        Err(_) => Err(format!(
                            "processor {} timed out after {:?}",
                            name, self.config.processor_timeout
                        )
                        .into()),
                    };
                    (name, result)
                }
            });
            for (name, result) in futures::future::join_all(runs).await {
                match result {
                    Ok(()) => succeeded.push(name),
                    Err(e) => {
                        warn!(processor = name, from, to, error = %e, "live processor failed");
                        metrics::PROCESSOR_FAILURES
                            .with_label_values(&[name, "live_deriver"])
                            .inc();
                        if let Err(log_err) = self
                            .repository
                            .log_indexing_error(
                                name,
                                from,
                                IndexingErrorKind::LiveDeriverError.as_str(),
                                &e.to_string(),
                            )
                            .await
                        {
                            error!(error = %log_err, "failed to log indexing error");
                        }
                        self.enqueue_retry(name, from, to, 1);
                    }
                }
            }
        }

        for name in succeeded {
            let current = self
                .repository
                .get_last_indexed_height(name)
                .await
                .ok()
                .flatten()
                .unwrap_or(0);
            if to > current {
                if let Err(e) = self.repository.update_checkpoint(name, to).await {
                    error!(processor = name, error = %e, "checkpoint update failed");
                } else {
                    metrics::CHECKPOINT_HEIGHT
                        .with_label_values(&[name])
                        .set(to as i64);
                }
            }
        }
    }

    /// Bounded queue, oldest dropped on overflow.
    fn enqueue_retry(&self, processor: &str, from: u64, to: u64, attempt: u32) {
        let mut queue = self.retry_queue.lock().unwrap();
        if queue.len() >= RETRY_QUEUE_CAP {
            queue.pop_front();
        }
        let backoff = RETRY_BASE * 2u32.saturating_pow(attempt.saturating_sub(1));
        queue.push_back(RetryItem {
            processor: processor.to_string(),
            from,
            to,
            attempt,
            due_at: Instant::now() + backoff,
        });
        metrics::RETRY_QUEUE_DEPTH.set(queue.len() as i64);
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry_queue.lock().unwrap().len()
    }

    /// Re-run everything whose backoff has elapsed. Final giveup turns
    /// into a LIVE_DERIVER_SKIPPED error row so another engine can
    /// reprocess the range later.
    pub async fn process_due_retries(&self, cancel: &CancellationToken) {
        let now = Instant::now();
        let due: Vec<RetryItem> = {
            let mut queue = self.retry_queue.lock().unwrap();
            let mut due = Vec::new();
            let mut keep = VecDeque::new();
            while let Some(item) = queue.pop_front() {
                if item.due_at <= now {
                    due.push(item);
                } else {
                    keep.push_back(item);
                }
            }
            *queue = keep;
            metrics::RETRY_QUEUE_DEPTH.set(queue.len() as i64);
            due
        };

        for item in due {
            if cancel.is_cancelled() {
                return;
            }
            let Some(processor) = self.registry.get(&item.processor) else {
                continue;
            };
            let outcome = tokio::time::timeout(
                self.config.processor_timeout,
                processor.process_range(item.from, item.to, cancel),
            )
            .await;
            match outcome {
                Ok(Ok(())) => {
                    debug!(processor = %item.processor, from = item.from, "retry succeeded");
                    let _ = self
                        .repository
                        .resolve_errors_in_range(&item.processor, item.from, item.to)
                        .await;
                }
                _ if item.attempt >= MAX_LIVE_RETRIES => {
                    warn!(
                        processor = %item.processor,
                        from = item.from,
                        to = item.to,
                        "live retries exhausted; leaving for repair"
                    );
                    let _ = self
                        .repository
                        .log_indexing_error(
                            &item.processor,
                            item.from,
                            IndexingErrorKind::LiveDeriverSkipped.as_str(),
                            "live retries exhausted",
                        )
                        .await;
                }
                _ => {
                    self.enqueue_retry(&item.processor, item.from, item.to, item.attempt + 1);
                }
            }
        }
    }

    /// Background repair: group each processor's unresolved failed
    /// heights into ranges and re-run them. Heavy-upsert processors
    /// are serialized; the rest share a small concurrency budget.
    pub async fn run_repair(&self, cancel: CancellationToken) {
        info!("live deriver repair loop starting");
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let mut repaired_any = false;
            for processor in self.registry.all() {
                if cancel.is_cancelled() {
                    return;
                }
                match self.repair_processor(Arc::clone(processor), &cancel).await {
                    Ok(count) => repaired_any |= count > 0,
                    Err(e) => {
                        error!(processor = processor.name(), error = %e, "repair pass failed")
                    }
                }
            }
            let sleep = if repaired_any {
                Duration::from_secs(5)
            } else {
                Duration::from_secs(120)
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// One repair pass for one processor: returns how many ranges ran.
    async fn repair_processor(
        &self,
        processor: Arc<dyn Processor>,
        cancel: &CancellationToken,
    ) -> Result<usize, BoxError> {
        let name = processor.name();
        let errors = self
            .repository
            .list_unresolved_errors_by_worker(name, config::repair_batch())
            .await?;
        if errors.is_empty() {
            return Ok(0);
        }
        let heights: Vec<u64> = errors.iter().map(|e| e.block_height).collect();
        let ranges = group_error_ranges(&heights, REPAIR_MAX_GAP, self.config.chunk_size);

        let concurrency = if SERIALIZED_REPAIR_WORKERS.contains(&name) {
            1
        } else {
            config::repair_concurrency()
        };
        let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));

        let runs = ranges.iter().map(|(from, to)| {
            let semaphore = Arc::clone(&semaphore);
            let processor = Arc::clone(&processor);
            let (from, to) = (*from, *to);
            async move {
                let _permit = semaphore.acquire().await;
                let result = processor.process_range(from, to, cancel).await;
                (from, to, result)
            }
        });

        let mut ran = 0;
        for (from, to, result) in futures::future::join_all(runs).await {
            match result {
                Ok(()) => {
                    ran += 1;
                    metrics::REPAIR_RANGES.inc();
                    self.repository.resolve_errors_in_range(name, from, to).await?;
                    info!(processor = name, from, to, "repaired range");
                }
                Err(e) => {
                    warn!(processor = name, from, to, error = %e, "repair run failed");
                }
            }
        }
        Ok(ran)
    }
}

/// Group failed block heights into repair ranges: consecutive runs
/// bridged across gaps up to `max_gap`, each range padded up to a
/// multiple of `chunk_size`.
pub fn group_error_ranges(heights: &[u64], max_gap: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    if heights.is_empty() {
        return Vec::new();
    }
    let mut sorted = heights.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<(u64, u64)> = Vec::new();
    let mut start = sorted[0];
    let mut last = sorted[0];
    for &height in &sorted[1..] {
        if height - last <= max_gap {
            last = height;
        } else {
            ranges.push(pad_range(start, last, chunk_size));
            start = height;
            last = height;
        }
    }
    ranges.push(pad_range(start, last, chunk_size));
    ranges
}

fn pad_range(start: u64, last: u64, chunk_size: u64) -> (u64, u64) {
    let span = last - start + 1;
    let padded = span.div_ceil(chunk_size) * chunk_size;
    (start, start + padded)
}
