//! Lease-based async worker
//!
//! Runs one processor over aligned fixed-size ranges, using the lease
//! table for mutual exclusion and the checkpoint table for progress.
//! Many instances of the same worker type can run on different hosts;
//! the lease row decides who owns a range, and the committer (not the
//! worker) advances the checkpoint once completions are contiguous.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{BoxError, IndexingErrorKind};
use crate::metrics;
use crate::processor::Processor;
use crate::repository::{Repository, MAIN_INGESTER};

static WORKER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Aligned ranges the worker looks at past its checkpoint before
/// giving up the cycle.
const LOOKAHEAD: u64 = 5;

#[derive(Clone)]
pub struct AsyncWorkerConfig {
    /// Lease/range alignment; from and to are multiples of this.
    pub range_size: u64,
    /// How long a lease is held before the reaper may flip it.
    pub lease_ttl: Duration,
    /// Worker types whose checkpoint must reach a candidate's end
    /// before this worker enters it.
    pub dependencies: Vec<String>,
    /// Poll cadence.
    pub poll_interval: Duration,
}

impl Default for AsyncWorkerConfig {
    fn default() -> Self {
        Self {
            range_size: 1000,
            lease_ttl: Duration::from_secs(600),
            dependencies: Vec::new(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct AsyncWorker {
    processor: Arc<dyn Processor>,
    repository: Arc<dyn Repository>,
    config: AsyncWorkerConfig,
    worker_id: String,
}

impl AsyncWorker {
    pub fn new(
        processor: Arc<dyn Processor>,
        repository: Arc<dyn Repository>,
        config: AsyncWorkerConfig,
    ) -> Self {
        let worker_id = format!(
            "{}-{}-{}",
            processor.name(),
            std::process::id(),
            WORKER_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            processor,
            repository,
            config,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll loop: one candidate scan per tick.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            worker = self.processor.name(),
            worker_id = %self.worker_id,
            range_size = self.config.range_size,
            "async worker starting"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if let Err(e) = self.poll_once(&cancel).await {
                error!(worker = self.processor.name(), error = %e, "worker poll failed");
            }
        }
    }

    /// Scan up to LOOKAHEAD aligned ranges past the checkpoint and run
    /// the first one whose lease we can take. Returns true when a
    /// range was attempted (success or failure both consume the
    /// cycle).
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<bool, BoxError> {
        let worker_type = self.processor.name();
        let Some(raw_tip) = self.repository.get_last_indexed_height(MAIN_INGESTER).await? else {
            return Ok(false);
        };
        let checkpoint = self
            .repository
            .get_last_indexed_height(worker_type)
            .await?
            .unwrap_or(0);

        let range = self.config.range_size;
        let mut base = (checkpoint / range) * range;

        // Fresh worker against a partially backfilled store: start at
        // the first aligned range that has raw data instead of height 0.
        if let Some(block_range) = self.repository.get_block_range().await? {
            if block_range.min_height > checkpoint {
                base = (block_range.min_height / range) * range;
            }
        }

        for step in 0..=LOOKAHEAD {
            let from = base + step * range;
            let to = from + range;
            if to > raw_tip {
                break;
            }
            if !self.dependencies_ready(to).await? {
                break;
            }
            if self.attempt_range(from, to, cancel).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every declared dependency's checkpoint must cover the candidate
    /// range end. Dependencies advance monotonically, so the first
    /// unready candidate ends the scan.
    async fn dependencies_ready(&self, to: u64) -> Result<bool, BoxError> {
        for dependency in &self.config.dependencies {
            let dep_checkpoint = self
                .repository
                .get_last_indexed_height(dependency)
                .await?
                .unwrap_or(0);
            if dep_checkpoint < to {
                debug!(
                    worker = self.processor.name(),
                    dependency, to, dep_checkpoint, "dependency not ready"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Take (or reclaim) the lease for `[from, to)` and run the
    /// processor under it.
    async fn attempt_range(
        &self,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> Result<bool, BoxError> {
        let worker_type = self.processor.name();
        let mut lease_id = self
            .repository
            .acquire_lease(worker_type, from, to, &self.worker_id, self.config.lease_ttl)
            .await?;
        if lease_id != 0 {
            metrics::LEASE_EVENTS.with_label_values(&["acquired"]).inc();
        } else {
            lease_id = self
                .repository
                .reclaim_lease(worker_type, from, to, &self.worker_id, self.config.lease_ttl)
                .await?;
            if lease_id != 0 {
                metrics::LEASE_EVENTS.with_label_values(&["reclaimed"]).inc();
            }
        }
        if lease_id == 0 {
            // Active or completed under another worker.
            return Ok(false);
        }

        let timer = metrics::PROCESSOR_DURATION
            .with_label_values(&[worker_type])
            .start_timer();
        let result = self.processor.process_range(from, to, cancel).await;
        timer.observe_duration();

        match result {
            Ok(()) => {
                self.repository.complete_lease(lease_id).await?;
                metrics::LEASE_EVENTS.with_label_values(&["completed"]).inc();
                debug!(worker = worker_type, from, to, "range completed");
            }
            Err(e) => {
                error!(worker = worker_type, from, to, error = %e, "range failed");
                metrics::PROCESSOR_FAILURES
                    .with_label_values(&[worker_type, "async_worker"])
                    .inc();
                self.repository
                    .log_indexing_error(
                        worker_type,
                        from,
                        IndexingErrorKind::ProcessError.as_str(),
                        &e.to_string(),
                    )
                    .await?;
                self.repository.fail_lease(lease_id, &e.to_string()).await?;
                metrics::LEASE_EVENTS.with_label_values(&["failed"]).inc();
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::TOKEN_WORKER;
    use crate::testutil::{make_block, MemoryRepository};
    use crate::types::LeaseStatus;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    struct CountingProcessor {
        name: &'static str,
        runs: AtomicU64,
        fail: bool,
    }

    impl CountingProcessor {
        fn ok(name: &'static str) -> Self {
            Self {
                name,
                runs: AtomicU64::new(0),
                fail: false,
            }
        }

        fn failing(name: &'static str) -> Self {
            Self {
                name,
                runs: AtomicU64::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Processor for CountingProcessor {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn process_range(
            &self,
            _from: u64,
            _to: u64,
            _cancel: &CancellationToken,
        ) -> Result<(), BoxError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("synthetic processor failure".into())
            } else {
                Ok(())
            }
        }
    }

    fn seeded_repo(raw_tip: u64) -> Arc<MemoryRepository> {
        let repo = Arc::new(MemoryRepository::new());
        repo.seed_blocks(vec![make_block(0)]);
        repo.set_checkpoint(MAIN_INGESTER, raw_tip);
        repo
    }

    fn worker_with(
        processor: Arc<CountingProcessor>,
        repo: &Arc<MemoryRepository>,
        range_size: u64,
    ) -> AsyncWorker {
        AsyncWorker::new(
            processor,
            Arc::clone(repo) as Arc<dyn Repository>,
            AsyncWorkerConfig {
                range_size,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_successful_range_completes_lease_without_touching_checkpoint() {
        let repo = seeded_repo(2000);
        let processor = Arc::new(CountingProcessor::ok(TOKEN_WORKER));
        let worker = worker_with(Arc::clone(&processor), &repo, 1000);

        let consumed = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(consumed);
        assert_eq!(processor.runs.load(Ordering::SeqCst), 1);

        let leases = repo.leases();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].status, LeaseStatus::Completed);
        assert_eq!((leases[0].from_height, leases[0].to_height), (0, 1000));
        // The committer owns checkpoint advancement.
        assert_eq!(
            repo.get_last_indexed_height(TOKEN_WORKER).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_failed_range_fails_lease_and_logs() {
        let repo = seeded_repo(2000);
        let processor = Arc::new(CountingProcessor::failing(TOKEN_WORKER));
        let worker = worker_with(Arc::clone(&processor), &repo, 1000);

        let consumed = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(consumed);

        let leases = repo.leases();
        assert_eq!(leases[0].status, LeaseStatus::Failed);
        assert!(leases[0].last_error.as_ref().unwrap().contains("synthetic"));
        let errors = repo.indexing_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "PROCESS_ERROR");
        assert_eq!(errors[0].block_height, 0);
    }

    #[tokio::test]
    async fn test_reclaim_failed_lease_from_other_worker() {
        // S3: worker A fails a lease, worker B reclaims it.
        let repo = seeded_repo(3000);
        let failing = Arc::new(CountingProcessor::failing(TOKEN_WORKER));
        let worker_a = worker_with(Arc::clone(&failing), &repo, 1000);
        worker_a.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(repo.leases()[0].status, LeaseStatus::Failed);
        assert_eq!(repo.leases()[0].attempt, 1);

        let healthy = Arc::new(CountingProcessor::ok(TOKEN_WORKER));
        let worker_b = worker_with(Arc::clone(&healthy), &repo, 1000);
        let consumed = worker_b.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(consumed);

        let lease = &repo.leases()[0];
        assert_eq!(lease.status, LeaseStatus::Completed);
        assert_eq!(lease.attempt, 2);
        assert_eq!(lease.worker_id, worker_b.worker_id());
        assert_ne!(worker_a.worker_id(), worker_b.worker_id());
    }

    #[tokio::test]
    async fn test_lookahead_skips_taken_ranges() {
        let repo = seeded_repo(10_000);
        // Another worker holds [0, 1000) active.
        let other = repo
            .acquire_lease(TOKEN_WORKER, 0, 1000, "other", Duration::from_secs(60))
            .await
            .unwrap();
        assert_ne!(other, 0);

        let processor = Arc::new(CountingProcessor::ok(TOKEN_WORKER));
        let worker = worker_with(Arc::clone(&processor), &repo, 1000);
        let consumed = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(consumed);

        // The worker moved on to the next aligned range.
        let leases = repo.leases();
        assert!(leases
            .iter()
            .any(|l| l.from_height == 1000 && l.status == LeaseStatus::Completed));
    }

    #[tokio::test]
    async fn test_dependency_gate_blocks() {
        let repo = seeded_repo(5000);
        let processor = Arc::new(CountingProcessor::ok("ft_holdings_worker"));
        let worker = AsyncWorker::new(
            Arc::clone(&processor) as Arc<dyn Processor>,
            Arc::clone(&repo) as Arc<dyn Repository>,
            AsyncWorkerConfig {
                range_size: 1000,
                dependencies: vec![TOKEN_WORKER.to_string()],
                ..Default::default()
            },
        );

        // Token worker hasn't covered [0, 1000) yet.
        repo.set_checkpoint(TOKEN_WORKER, 500);
        let consumed = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(!consumed);
        assert_eq!(processor.runs.load(Ordering::SeqCst), 0);

        // Once the dependency covers the range, work proceeds.
        repo.set_checkpoint(TOKEN_WORKER, 1000);
        let consumed = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(consumed);
        assert_eq!(processor.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fast_forward_to_raw_minimum() {
        let repo = Arc::new(MemoryRepository::new());
        repo.seed_blocks(vec![make_block(5000), make_block(5001)]);
        repo.set_checkpoint(MAIN_INGESTER, 7000);

        let processor = Arc::new(CountingProcessor::ok(TOKEN_WORKER));
        let worker = worker_with(Arc::clone(&processor), &repo, 1000);
        worker.poll_once(&CancellationToken::new()).await.unwrap();

        let leases = repo.leases();
        assert_eq!(leases[0].from_height, 5000);
    }
}
