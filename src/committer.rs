//! Checkpoint committer
//!
//! Background singleton that turns completed leases into checkpoint
//! progress. Advancement is strictly contiguous: a FAILED or ACTIVE
//! lease in the middle pins the checkpoint below it. The committer
//! also reaps expired leases, reports coverage gaps between completed
//! leases, and screams about dead leases (attempt >= 20) that need an
//! operator.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::BoxError;
use crate::metrics;
use crate::repository::Repository;

const ADVANCE_INTERVAL: Duration = Duration::from_secs(5);
/// Reap every 6th advance tick (30s), gap/dead checks every 12th (60s).
const REAP_EVERY: u64 = 6;
const GAP_EVERY: u64 = 12;

pub struct CheckpointCommitter {
    repository: Arc<dyn Repository>,
    worker_types: Vec<String>,
}

impl CheckpointCommitter {
    pub fn new(repository: Arc<dyn Repository>, worker_types: Vec<String>) -> Self {
        Self {
            repository,
            worker_types,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(workers = self.worker_types.len(), "checkpoint committer starting");
        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(ADVANCE_INTERVAL) => {}
            }
            tick += 1;
            if let Err(e) = self.advance_all().await {
                error!(error = %e, "checkpoint advancement failed");
            }
            if tick % REAP_EVERY == 0 {
                if let Err(e) = self.reap().await {
                    error!(error = %e, "lease reaping failed");
                }
            }
            if tick % GAP_EVERY == 0 {
                if let Err(e) = self.audit().await {
                    error!(error = %e, "lease audit failed");
                }
            }
        }
    }

    /// Advance every tracked worker's checkpoint to the end of its
    /// contiguous completed prefix.
    pub async fn advance_all(&self) -> Result<(), BoxError> {
        for worker in &self.worker_types {
            let old = self
                .repository
                .get_last_indexed_height(worker)
                .await?
                .unwrap_or(0);
            let new = self.repository.advance_checkpoint_safe(worker).await?;
            metrics::CHECKPOINT_HEIGHT
                .with_label_values(&[worker.as_str()])
                .set(new as i64);
            if new > old {
                info!(worker = %worker, from = old, to = new, "checkpoint advanced");
            }
        }
        Ok(())
    }

    pub async fn reap(&self) -> Result<(), BoxError> {
        let reaped = self.repository.reap_expired_leases().await?;
        if reaped > 0 {
            metrics::LEASE_EVENTS
                .with_label_values(&["reaped"])
                .inc_by(reaped);
            info!(reaped, "expired leases flipped to FAILED");
        }
        Ok(())
    }

    /// Log-only diagnostics: coverage gaps and dead leases.
    pub async fn audit(&self) -> Result<(), BoxError> {
        for worker in &self.worker_types {
            let gaps = self.repository.detect_lease_gaps(worker).await?;
            for gap in &gaps {
                warn!(
                    worker = %worker,
                    from = gap.from_height,
                    to = gap.to_height,
                    "lease coverage gap"
                );
            }
        }
        let dead = self.repository.count_dead_leases().await?;
        metrics::DEAD_LEASES.set(dead as i64);
        if dead > 0 {
            error!(
                dead,
                "CRITICAL: dead leases blocking progress; operator intervention required"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::TOKEN_WORKER;
    use crate::testutil::MemoryRepository;
    use crate::types::LeaseStatus;

    async fn lease(
        repo: &MemoryRepository,
        from: u64,
        to: u64,
        status: LeaseStatus,
    ) -> u64 {
        let id = repo
            .acquire_lease(TOKEN_WORKER, from, to, "w", Duration::from_secs(60))
            .await
            .unwrap();
        match status {
            LeaseStatus::Active => {}
            LeaseStatus::Completed => repo.complete_lease(id).await.unwrap(),
            LeaseStatus::Failed => repo.fail_lease(id, "boom").await.unwrap(),
        }
        id
    }

    fn committer(repo: &Arc<MemoryRepository>) -> CheckpointCommitter {
        CheckpointCommitter::new(
            Arc::clone(repo) as Arc<dyn Repository>,
            vec![TOKEN_WORKER.to_string()],
        )
    }

    #[tokio::test]
    async fn test_contiguous_advancement() {
        let repo = Arc::new(MemoryRepository::new());
        lease(&repo, 0, 1000, LeaseStatus::Completed).await;
        lease(&repo, 1000, 2000, LeaseStatus::Completed).await;
        // A hole: [2000, 3000) missing entirely.
        lease(&repo, 3000, 4000, LeaseStatus::Completed).await;

        committer(&repo).advance_all().await.unwrap();
        assert_eq!(
            repo.get_last_indexed_height(TOKEN_WORKER).await.unwrap(),
            Some(2000)
        );
    }

    #[tokio::test]
    async fn test_failed_lease_blocks_advancement() {
        let repo = Arc::new(MemoryRepository::new());
        lease(&repo, 0, 1000, LeaseStatus::Completed).await;
        lease(&repo, 1000, 2000, LeaseStatus::Failed).await;
        lease(&repo, 2000, 3000, LeaseStatus::Completed).await;

        committer(&repo).advance_all().await.unwrap();
        assert_eq!(
            repo.get_last_indexed_height(TOKEN_WORKER).await.unwrap(),
            Some(1000)
        );

        // Once the failed range completes, advancement resumes past it.
        let id = repo
            .reclaim_lease(TOKEN_WORKER, 1000, 2000, "w2", Duration::from_secs(60))
            .await
            .unwrap();
        repo.complete_lease(id).await.unwrap();
        committer(&repo).advance_all().await.unwrap();
        assert_eq!(
            repo.get_last_indexed_height(TOKEN_WORKER).await.unwrap(),
            Some(3000)
        );
    }

    #[tokio::test]
    async fn test_checkpoint_never_decreases() {
        let repo = Arc::new(MemoryRepository::new());
        repo.set_checkpoint(TOKEN_WORKER, 5000);
        lease(&repo, 0, 1000, LeaseStatus::Completed).await;

        committer(&repo).advance_all().await.unwrap();
        assert_eq!(
            repo.get_last_indexed_height(TOKEN_WORKER).await.unwrap(),
            Some(5000)
        );
    }

    #[tokio::test]
    async fn test_reap_flips_expired_leases() {
        let repo = Arc::new(MemoryRepository::new());
        let id = lease(&repo, 0, 1000, LeaseStatus::Active).await;
        repo.expire_lease_now(id);

        committer(&repo).reap().await.unwrap();
        let leases = repo.leases();
        assert_eq!(leases[0].status, LeaseStatus::Failed);
        assert_eq!(leases[0].last_error.as_deref(), Some("expired"));
    }

    #[tokio::test]
    async fn test_audit_counts_dead_and_gaps() {
        let repo = Arc::new(MemoryRepository::new());
        lease(&repo, 0, 1000, LeaseStatus::Completed).await;
        lease(&repo, 2000, 3000, LeaseStatus::Completed).await;

        let gaps = repo.detect_lease_gaps(TOKEN_WORKER).await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!((gaps[0].from_height, gaps[0].to_height), (1000, 2000));

        // Audit itself only logs; it must not error.
        committer(&repo).audit().await.unwrap();
        assert_eq!(repo.count_dead_leases().await.unwrap(), 0);
    }
}
