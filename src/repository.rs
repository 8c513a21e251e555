//! Repository contract
//!
//! The persistent store behind the pipeline, as a typed async trait.
//! Raw tables are written only by the ingest services (and rewritten on
//! reorg rollback); derived tables are written by processors through
//! idempotent upserts; the lease table is the exclusion primitive and
//! the checkpoint table records contiguous progress.
//!
//! Implementations guarantee: `save_batch` is atomic, the lease
//! operations are atomic relative to one another, and
//! `advance_checkpoint_safe` only ever moves a checkpoint to the end of
//! a contiguous prefix of COMPLETED leases.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::BoxError;
use crate::types::*;

/// Worker type under which the forward ingester checkpoints.
pub const MAIN_INGESTER: &str = "main_ingester";

#[async_trait]
pub trait Repository: Send + Sync {
    // -- raw tables ---------------------------------------------------

    /// Persist a batch of blocks with their transactions and events and
    /// advance `service_name`'s checkpoint to `checkpoint`, all in one
    /// transaction.
    async fn save_batch(
        &self,
        blocks: &[Block],
        transactions: &[Transaction],
        events: &[Event],
        service_name: &str,
        checkpoint: u64,
    ) -> Result<(), BoxError>;

    /// Events with `from <= block_height < to`, ordered by
    /// (block_height, transaction_index, event_index).
    async fn get_raw_events_in_range(&self, from: u64, to: u64) -> Result<Vec<Event>, BoxError>;

    /// Transactions with `from <= block_height < to`, ordered by
    /// (block_height, transaction_index).
    async fn get_raw_transactions_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<Transaction>, BoxError>;

    /// (transaction_id, script_hash, block_height) triples in range.
    async fn get_tx_script_hashes_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<(String, String, u64)>, BoxError>;

    /// script_hash → script text for the given hashes.
    async fn get_script_texts_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, String>, BoxError>;

    async fn get_block_id_by_height(&self, height: u64) -> Result<Option<String>, BoxError>;

    /// Extent of the raw block table, None when empty.
    async fn get_block_range(&self) -> Result<Option<BlockRange>, BoxError>;

    /// True when every height in `[from, to)` has a stored block.
    async fn has_blocks_in_range(&self, from: u64, to: u64) -> Result<bool, BoxError>;

    /// Delete all raw rows with height >= `height` (reorg rollback) and
    /// clamp the owning checkpoints down accordingly.
    async fn rollback_from_height(&self, height: u64) -> Result<(), BoxError>;

    // -- derived tables -----------------------------------------------

    /// Make sure partitions exist for app tables covering the range.
    async fn ensure_app_partitions(&self, min: u64, max: u64) -> Result<(), BoxError>;

    async fn upsert_ft_transfers(&self, rows: &[TokenTransfer]) -> Result<(), BoxError>;
    async fn upsert_nft_transfers(&self, rows: &[TokenTransfer]) -> Result<(), BoxError>;

    /// Materialized FT transfers in `[from, to)`, ordered by
    /// (block_height, event_index). Input of the holdings workers,
    /// which is why they gate on the token worker's checkpoint.
    async fn get_ft_transfers_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<TokenTransfer>, BoxError>;

    /// Materialized NFT transfers in `[from, to)`, same ordering.
    async fn get_nft_transfers_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<TokenTransfer>, BoxError>;

    async fn upsert_ft_holdings_delta(&self, rows: &[FtHoldingDelta]) -> Result<(), BoxError>;
    async fn upsert_nft_ownership(&self, rows: &[NftOwnership]) -> Result<(), BoxError>;
    async fn delete_nft_ownership(&self, contract_id: &str, nft_id: &str) -> Result<(), BoxError>;
    async fn upsert_daily_balance_delta(&self, rows: &[DailyBalanceDelta]) -> Result<(), BoxError>;
    async fn upsert_accounts(&self, rows: &[AccountRow]) -> Result<(), BoxError>;
    async fn upsert_coa_accounts(&self, rows: &[CoaAccountRow]) -> Result<(), BoxError>;
    async fn upsert_evm_tx_hashes(&self, rows: &[EvmTxHashRow]) -> Result<(), BoxError>;
    async fn upsert_account_keys(&self, rows: &[AccountKeyRow]) -> Result<(), BoxError>;
    async fn upsert_smart_contracts(&self, rows: &[SmartContractRow]) -> Result<(), BoxError>;
    async fn upsert_contract_registry(&self, rows: &[ContractRegistryRow])
        -> Result<(), BoxError>;
    async fn upsert_staking_events(&self, rows: &[StakingEventRow]) -> Result<(), BoxError>;
    async fn upsert_staking_nodes(&self, rows: &[StakingNodeRow]) -> Result<(), BoxError>;
    async fn upsert_epoch_stats(&self, rows: &[EpochStatsRow]) -> Result<(), BoxError>;
    async fn upsert_defi_events(&self, rows: &[DefiEventRow]) -> Result<(), BoxError>;
    async fn upsert_defi_pairs(&self, rows: &[DefiPairRow]) -> Result<(), BoxError>;
    async fn upsert_address_transactions(
        &self,
        rows: &[AddressTransactionRow],
    ) -> Result<(), BoxError>;
    async fn upsert_tx_contracts(&self, rows: &[TxContractRow]) -> Result<(), BoxError>;
    async fn upsert_tx_tags(&self, rows: &[TxTagRow]) -> Result<(), BoxError>;
    async fn upsert_token_metadata(&self, rows: &[TokenMetadataRow]) -> Result<(), BoxError>;

    /// SQL-side materialization of the per-address tx index and stats.
    async fn backfill_address_transactions_and_stats_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<(), BoxError>;

    async fn backfill_tx_metrics_range(&self, from: u64, to: u64) -> Result<(), BoxError>;
    async fn refresh_daily_stats_range(&self, from: u64, to: u64) -> Result<(), BoxError>;
    async fn refresh_analytics_daily_metrics_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<(), BoxError>;

    // -- metadata / reconciler work queues ----------------------------

    /// FT contract ids with no metadata row yet.
    async fn list_ft_tokens_missing_metadata(&self, limit: u64) -> Result<Vec<String>, BoxError>;

    /// NFT contract ids with no metadata row yet.
    async fn list_nft_tokens_missing_metadata(&self, limit: u64) -> Result<Vec<String>, BoxError>;

    /// (contract_id, owner) pairs with the largest holdings, for
    /// ownership reconciliation.
    async fn list_top_owner_collections(
        &self,
        limit: u64,
    ) -> Result<Vec<(String, String)>, BoxError>;

    /// Current ownership claims for one (contract, owner) pair.
    async fn list_nft_ownership(
        &self,
        contract_id: &str,
        owner: &str,
        limit: u64,
    ) -> Result<Vec<NftOwnership>, BoxError>;

    // -- checkpoints --------------------------------------------------

    async fn get_last_indexed_height(&self, name: &str) -> Result<Option<u64>, BoxError>;

    /// Set a checkpoint directly. Owned by the ingest services (their
    /// own name) and the live deriver; everyone else goes through the
    /// committer.
    async fn update_checkpoint(&self, name: &str, height: u64) -> Result<(), BoxError>;

    /// Advance `name` to the highest `to_height` reachable through a
    /// contiguous prefix of COMPLETED leases starting at the current
    /// checkpoint. Returns the (possibly unchanged) checkpoint.
    async fn advance_checkpoint_safe(&self, name: &str) -> Result<u64, BoxError>;

    // -- leases -------------------------------------------------------

    /// Insert a new ACTIVE lease; returns its id, or 0 when a lease for
    /// (worker_type, from, to) already exists.
    async fn acquire_lease(
        &self,
        worker_type: &str,
        from: u64,
        to: u64,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<u64, BoxError>;

    /// Take over a FAILED lease: flip to ACTIVE under `worker_id`,
    /// increment attempt, reset expiry. Returns 0 when the lease is
    /// ACTIVE or COMPLETED elsewhere (or absent).
    async fn reclaim_lease(
        &self,
        worker_type: &str,
        from: u64,
        to: u64,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<u64, BoxError>;

    async fn complete_lease(&self, lease_id: u64) -> Result<(), BoxError>;
    async fn fail_lease(&self, lease_id: u64, error: &str) -> Result<(), BoxError>;

    /// Flip expired ACTIVE leases to FAILED; returns how many.
    async fn reap_expired_leases(&self) -> Result<u64, BoxError>;

    /// Missing ranges between adjacent COMPLETED leases.
    async fn detect_lease_gaps(&self, worker_type: &str) -> Result<Vec<LeaseGap>, BoxError>;

    /// FAILED leases with attempt >= the dead threshold.
    async fn count_dead_leases(&self) -> Result<u64, BoxError>;

    // -- indexing error log -------------------------------------------

    async fn log_indexing_error(
        &self,
        worker_type: &str,
        block_height: u64,
        kind: &str,
        message: &str,
    ) -> Result<(), BoxError>;

    async fn list_unresolved_errors_by_worker(
        &self,
        worker_type: &str,
        limit: u64,
    ) -> Result<Vec<IndexingErrorRow>, BoxError>;

    /// Mark every unresolved error of `worker_type` within
    /// `[from, to)` as resolved.
    async fn resolve_errors_in_range(
        &self,
        worker_type: &str,
        from: u64,
        to: u64,
    ) -> Result<(), BoxError>;
}

/// Attempts at which a FAILED lease counts as dead (operator needed).
pub const DEAD_LEASE_ATTEMPTS: u32 = 20;
