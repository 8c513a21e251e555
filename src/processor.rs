//! Processor contract and registry
//!
//! A processor derives one family of view tables from the raw tables
//! over a half-open height range. Runs must be idempotent: the engines
//! re-run ranges freely after failures, repairs and reorgs. Processors
//! are registered explicitly and dispatched by name; the set is closed.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;
use crate::pool::PinnedPool;
use crate::repository::Repository;

// Canonical worker-type names. These double as checkpoint and lease
// keys, so they are part of the persistent schema; do not rename.
pub const TOKEN_WORKER: &str = "token_worker";
pub const FT_HOLDINGS_WORKER: &str = "ft_holdings_worker";
pub const NFT_OWNERSHIP_WORKER: &str = "nft_ownership_worker";
pub const DAILY_BALANCE_WORKER: &str = "daily_balance_worker";
pub const ACCOUNTS_WORKER: &str = "accounts_worker";
pub const EVM_WORKER: &str = "evm_worker";
pub const META_WORKER: &str = "meta_worker";
pub const TX_CONTRACTS_WORKER: &str = "tx_contracts_worker";
pub const STAKING_WORKER: &str = "staking_worker";
pub const DEFI_WORKER: &str = "defi_worker";
pub const DAILY_STATS_WORKER: &str = "daily_stats_worker";
pub const TOKEN_METADATA_WORKER: &str = "token_metadata_worker";
pub const NFT_RECONCILER_WORKER: &str = "nft_reconciler_worker";

/// Processors that consume the token transfer builder's output and
/// therefore run in the second phase of every derivation pass.
pub const PHASE_TWO_WORKERS: &[&str] = &[
    FT_HOLDINGS_WORKER,
    NFT_OWNERSHIP_WORKER,
    DAILY_BALANCE_WORKER,
];

/// Processors whose upserts hit shared hot rows; the repair loop runs
/// them with concurrency 1.
pub const SERIALIZED_REPAIR_WORKERS: &[&str] = &[ACCOUNTS_WORKER, TOKEN_WORKER, META_WORKER];

/// One range-scoped, idempotent derivation.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Stable name; doubles as the checkpoint/lease worker type.
    fn name(&self) -> &'static str;

    /// Derive this processor's tables for raw heights `[from, to)`.
    async fn process_range(
        &self,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError>;
}

/// Shared handles every processor is built from.
#[derive(Clone)]
pub struct ProcessorContext {
    pub repository: Arc<dyn Repository>,
    pub pool: Arc<PinnedPool>,
}

impl ProcessorContext {
    pub fn new(repository: Arc<dyn Repository>, pool: Arc<PinnedPool>) -> Self {
        Self { repository, pool }
    }
}

/// Explicit registry; lookups are by name only.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: Vec<Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        if self.get(processor.name()).is_some() {
            panic!("duplicate processor registration: {}", processor.name());
        }
        self.processors.push(processor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Processor>> {
        self.processors
            .iter()
            .find(|p| p.name() == name)
            .map(Arc::clone)
    }

    pub fn all(&self) -> &[Arc<dyn Processor>] {
        &self.processors
    }

    /// Split into the two derivation phases: everything independent of
    /// the token transfer builder first, its consumers second.
    pub fn phases(&self) -> (Vec<Arc<dyn Processor>>, Vec<Arc<dyn Processor>>) {
        let mut phase_one = Vec::new();
        let mut phase_two = Vec::new();
        for p in &self.processors {
            if PHASE_TWO_WORKERS.contains(&p.name()) {
                phase_two.push(Arc::clone(p));
            } else {
                phase_one.push(Arc::clone(p));
            }
        }
        (phase_one, phase_two)
    }
}
