//! In-memory store backend
//!
//! A complete `Repository` over process memory, used for development
//! runs (`--store memory`) and throughout the test suite. One mutex
//! guards all state, which also gives the lease operations their
//! required atomicity. Data does not survive a restart.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::BoxError;
use crate::repository::{Repository, DEAD_LEASE_ATTEMPTS};
use crate::types::*;

#[derive(Default)]
struct RepoInner {
    blocks: BTreeMap<u64, Block>,
    transactions: Vec<Transaction>,
    events: Vec<Event>,
    checkpoints: HashMap<String, u64>,
    leases: Vec<Lease>,
    next_lease_id: u64,
    errors: Vec<IndexingErrorRow>,
    next_error_id: u64,

    ft_transfers: BTreeMap<(String, u32), TokenTransfer>,
    nft_transfers: BTreeMap<(String, u32), TokenTransfer>,
    holding_deltas: BTreeMap<(String, String, u64), FtHoldingDelta>,
    nft_ownership: BTreeMap<(String, String), NftOwnership>,
    daily_deltas: BTreeMap<(String, String, String), DailyBalanceDelta>,
    accounts: BTreeMap<String, AccountRow>,
    coa_accounts: BTreeMap<String, CoaAccountRow>,
    evm_hashes: BTreeMap<(u64, String, u32), EvmTxHashRow>,
    account_keys: Vec<AccountKeyRow>,
    smart_contracts: BTreeMap<(String, String), SmartContractRow>,
    contract_registry: BTreeMap<String, ContractRegistryRow>,
    staking_events: Vec<StakingEventRow>,
    staking_nodes: BTreeMap<String, StakingNodeRow>,
    epoch_stats: BTreeMap<u64, EpochStatsRow>,
    defi_events: Vec<DefiEventRow>,
    defi_pairs: BTreeMap<String, DefiPairRow>,
    address_transactions: BTreeMap<(String, String, String), AddressTransactionRow>,
    tx_contracts: BTreeMap<(String, String), TxContractRow>,
    tx_tags: BTreeMap<(String, String), TxTagRow>,
    token_metadata: BTreeMap<String, TokenMetadataRow>,

    partition_calls: Vec<(u64, u64)>,
    backfill_calls: Vec<(String, u64, u64)>,
    rollback_calls: Vec<u64>,
}

/// In-memory `Repository`. One mutex guards everything, which also
/// gives the lease operations their required atomicity. The seed and
/// accessor helpers double as the test inspection surface.
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<RepoInner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_blocks(&self, blocks: Vec<Block>) {
        let mut inner = self.inner.lock().unwrap();
        for b in blocks {
            inner.blocks.insert(b.height, b);
        }
    }

    pub fn seed_transactions(&self, txs: Vec<Transaction>) {
        self.inner.lock().unwrap().transactions.extend(txs);
    }

    pub fn seed_events(&self, events: Vec<Event>) {
        self.inner.lock().unwrap().events.extend(events);
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.inner.lock().unwrap().blocks.values().cloned().collect()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.inner.lock().unwrap().transactions.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn ft_transfers(&self) -> Vec<TokenTransfer> {
        self.inner.lock().unwrap().ft_transfers.values().cloned().collect()
    }

    pub fn nft_transfers(&self) -> Vec<TokenTransfer> {
        self.inner.lock().unwrap().nft_transfers.values().cloned().collect()
    }

    pub fn holding_deltas(&self) -> Vec<FtHoldingDelta> {
        self.inner.lock().unwrap().holding_deltas.values().cloned().collect()
    }

    /// Balance view: sum of keyed delta rows per (address, contract).
    pub fn ft_holdings(&self) -> BTreeMap<(String, String), String> {
        use bigdecimal::BigDecimal;
        use std::str::FromStr;
        let inner = self.inner.lock().unwrap();
        let mut balances: BTreeMap<(String, String), BigDecimal> = BTreeMap::new();
        for d in inner.holding_deltas.values() {
            let delta = BigDecimal::from_str(&d.delta).unwrap_or_default();
            *balances
                .entry((d.address.clone(), d.contract_id.clone()))
                .or_default() += delta;
        }
        balances
            .into_iter()
            .map(|(k, v)| (k, v.normalized().to_string()))
            .collect()
    }

    pub fn nft_ownership_rows(&self) -> Vec<NftOwnership> {
        self.inner.lock().unwrap().nft_ownership.values().cloned().collect()
    }

    pub fn daily_deltas(&self) -> Vec<DailyBalanceDelta> {
        self.inner.lock().unwrap().daily_deltas.values().cloned().collect()
    }

    pub fn accounts(&self) -> Vec<AccountRow> {
        self.inner.lock().unwrap().accounts.values().cloned().collect()
    }

    pub fn coa_accounts(&self) -> Vec<CoaAccountRow> {
        self.inner.lock().unwrap().coa_accounts.values().cloned().collect()
    }

    pub fn evm_hashes(&self) -> Vec<EvmTxHashRow> {
        self.inner.lock().unwrap().evm_hashes.values().cloned().collect()
    }

    pub fn account_keys(&self) -> Vec<AccountKeyRow> {
        self.inner.lock().unwrap().account_keys.clone()
    }

    pub fn smart_contracts(&self) -> Vec<SmartContractRow> {
        self.inner.lock().unwrap().smart_contracts.values().cloned().collect()
    }

    pub fn contract_registry(&self) -> Vec<ContractRegistryRow> {
        self.inner.lock().unwrap().contract_registry.values().cloned().collect()
    }

    pub fn staking_events(&self) -> Vec<StakingEventRow> {
        self.inner.lock().unwrap().staking_events.clone()
    }

    pub fn epoch_stats(&self) -> Vec<EpochStatsRow> {
        self.inner.lock().unwrap().epoch_stats.values().cloned().collect()
    }

    pub fn staking_nodes(&self) -> Vec<StakingNodeRow> {
        self.inner.lock().unwrap().staking_nodes.values().cloned().collect()
    }

    pub fn defi_events(&self) -> Vec<DefiEventRow> {
        self.inner.lock().unwrap().defi_events.clone()
    }

    pub fn defi_pairs(&self) -> Vec<DefiPairRow> {
        self.inner.lock().unwrap().defi_pairs.values().cloned().collect()
    }

    pub fn address_transactions(&self) -> Vec<AddressTransactionRow> {
        self.inner.lock().unwrap().address_transactions.values().cloned().collect()
    }

    pub fn tx_contracts(&self) -> Vec<TxContractRow> {
        self.inner.lock().unwrap().tx_contracts.values().cloned().collect()
    }

    pub fn tx_tags(&self) -> Vec<TxTagRow> {
        self.inner.lock().unwrap().tx_tags.values().cloned().collect()
    }

    pub fn token_metadata(&self) -> Vec<TokenMetadataRow> {
        self.inner.lock().unwrap().token_metadata.values().cloned().collect()
    }

    pub fn leases(&self) -> Vec<Lease> {
        self.inner.lock().unwrap().leases.clone()
    }

    pub fn indexing_errors(&self) -> Vec<IndexingErrorRow> {
        self.inner.lock().unwrap().errors.clone()
    }

    pub fn rollback_calls(&self) -> Vec<u64> {
        self.inner.lock().unwrap().rollback_calls.clone()
    }

    pub fn backfill_calls(&self) -> Vec<(String, u64, u64)> {
        self.inner.lock().unwrap().backfill_calls.clone()
    }

    pub fn set_checkpoint(&self, name: &str, height: u64) {
        self.inner
            .lock()
            .unwrap()
            .checkpoints
            .insert(name.to_string(), height);
    }

    pub fn seed_registry(&self, rows: Vec<ContractRegistryRow>) {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner.contract_registry.insert(r.contract_id.clone(), r);
        }
    }

    pub fn expire_lease_now(&self, lease_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(l) = inner.leases.iter_mut().find(|l| l.id == lease_id) {
            l.expires_at = Utc::now() - ChronoDuration::seconds(5);
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_batch(
        &self,
        blocks: &[Block],
        transactions: &[Transaction],
        events: &[Event],
        service_name: &str,
        checkpoint: u64,
    ) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for b in blocks {
            inner.blocks.insert(b.height, b.clone());
        }
        for t in transactions {
            inner.transactions.retain(|x| x.id != t.id);
            inner.transactions.push(t.clone());
        }
        for e in events {
            inner
                .events
                .retain(|x| !(x.transaction_id == e.transaction_id && x.event_index == e.event_index));
            inner.events.push(e.clone());
        }
        inner.checkpoints.insert(service_name.to_string(), checkpoint);
        Ok(())
    }

    async fn get_raw_events_in_range(&self, from: u64, to: u64) -> Result<Vec<Event>, BoxError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.block_height >= from && e.block_height < to)
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.block_height, e.transaction_index, e.event_index));
        Ok(out)
    }

    async fn get_raw_transactions_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<Transaction>, BoxError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Transaction> = inner
            .transactions
            .iter()
            .filter(|t| t.block_height >= from && t.block_height < to)
            .cloned()
            .collect();
        out.sort_by_key(|t| (t.block_height, t.transaction_index));
        Ok(out)
    }

    async fn get_tx_script_hashes_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<(String, String, u64)>, BoxError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .transactions
            .iter()
            .filter(|t| t.block_height >= from && t.block_height < to)
            .map(|t| (t.id.clone(), t.script_hash.clone(), t.block_height))
            .collect())
    }

    async fn get_script_texts_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, String>, BoxError> {
        let inner = self.inner.lock().unwrap();
        let mut out = HashMap::new();
        for t in &inner.transactions {
            if hashes.contains(&t.script_hash) {
                out.insert(t.script_hash.clone(), t.script.clone());
            }
        }
        Ok(out)
    }

    async fn get_block_id_by_height(&self, height: u64) -> Result<Option<String>, BoxError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .blocks
            .get(&height)
            .map(|b| b.id.clone()))
    }

    async fn get_block_range(&self) -> Result<Option<BlockRange>, BoxError> {
        let inner = self.inner.lock().unwrap();
        let min = inner.blocks.keys().next().copied();
        let max = inner.blocks.keys().next_back().copied();
        match (min, max) {
            (Some(min_height), Some(max_height)) => Ok(Some(BlockRange {
                min_height,
                max_height,
                max_timestamp: inner.blocks.get(&max_height).map(|b| b.timestamp),
            })),
            _ => Ok(None),
        }
    }

    async fn has_blocks_in_range(&self, from: u64, to: u64) -> Result<bool, BoxError> {
        let inner = self.inner.lock().unwrap();
        Ok((from..to).all(|h| inner.blocks.contains_key(&h)))
    }

    async fn rollback_from_height(&self, height: u64) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        inner.rollback_calls.push(height);
        inner.blocks.retain(|h, _| *h < height);
        inner.transactions.retain(|t| t.block_height < height);
        inner.events.retain(|e| e.block_height < height);
        for cp in inner.checkpoints.values_mut() {
            if *cp >= height {
                *cp = height.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn ensure_app_partitions(&self, min: u64, max: u64) -> Result<(), BoxError> {
        self.inner.lock().unwrap().partition_calls.push((min, max));
        Ok(())
    }

    async fn upsert_ft_transfers(&self, rows: &[TokenTransfer]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner
                .ft_transfers
                .insert((r.transaction_id.clone(), r.event_index), r.clone());
        }
        Ok(())
    }

    async fn upsert_nft_transfers(&self, rows: &[TokenTransfer]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner
                .nft_transfers
                .insert((r.transaction_id.clone(), r.event_index), r.clone());
        }
        Ok(())
    }

    async fn upsert_ft_holdings_delta(&self, rows: &[FtHoldingDelta]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            // Keyed by (address, contract, height): re-running a range
            // replaces the same rows instead of double-counting.
            inner.holding_deltas.insert(
                (r.address.clone(), r.contract_id.clone(), r.block_height),
                r.clone(),
            );
        }
        Ok(())
    }

    async fn get_ft_transfers_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<TokenTransfer>, BoxError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<TokenTransfer> = inner
            .ft_transfers
            .values()
            .filter(|t| t.block_height >= from && t.block_height < to)
            .cloned()
            .collect();
        out.sort_by_key(|t| (t.block_height, t.event_index));
        Ok(out)
    }

    async fn get_nft_transfers_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<TokenTransfer>, BoxError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<TokenTransfer> = inner
            .nft_transfers
            .values()
            .filter(|t| t.block_height >= from && t.block_height < to)
            .cloned()
            .collect();
        out.sort_by_key(|t| (t.block_height, t.event_index));
        Ok(out)
    }

    async fn upsert_nft_ownership(&self, rows: &[NftOwnership]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner
                .nft_ownership
                .insert((r.contract_id.clone(), r.nft_id.clone()), r.clone());
        }
        Ok(())
    }

    async fn delete_nft_ownership(&self, contract_id: &str, nft_id: &str) -> Result<(), BoxError> {
        self.inner
            .lock()
            .unwrap()
            .nft_ownership
            .remove(&(contract_id.to_string(), nft_id.to_string()));
        Ok(())
    }

    async fn upsert_daily_balance_delta(&self, rows: &[DailyBalanceDelta]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner.daily_deltas.insert(
                (r.address.clone(), r.contract_id.clone(), r.date.to_string()),
                r.clone(),
            );
        }
        Ok(())
    }

    async fn upsert_accounts(&self, rows: &[AccountRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner
                .accounts
                .entry(r.address.clone())
                .and_modify(|existing| {
                    existing.first_seen_height = existing.first_seen_height.min(r.first_seen_height);
                    existing.last_seen_height = existing.last_seen_height.max(r.last_seen_height);
                })
                .or_insert_with(|| r.clone());
        }
        Ok(())
    }

    async fn upsert_coa_accounts(&self, rows: &[CoaAccountRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner.coa_accounts.insert(r.evm_address.clone(), r.clone());
        }
        Ok(())
    }

    async fn upsert_evm_tx_hashes(&self, rows: &[EvmTxHashRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner.evm_hashes.insert(
                (r.block_height, r.transaction_id.clone(), r.event_index),
                r.clone(),
            );
        }
        Ok(())
    }

    async fn upsert_account_keys(&self, rows: &[AccountKeyRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner.account_keys.retain(|x| {
                !(x.address == r.address
                    && x.key_index == r.key_index
                    && x.transaction_id == r.transaction_id)
            });
            inner.account_keys.push(r.clone());
        }
        Ok(())
    }

    async fn upsert_smart_contracts(&self, rows: &[SmartContractRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner
                .smart_contracts
                .insert((r.address.clone(), r.name.clone()), r.clone());
        }
        Ok(())
    }

    async fn upsert_contract_registry(
        &self,
        rows: &[ContractRegistryRow],
    ) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner
                .contract_registry
                .entry(r.contract_id.clone())
                .and_modify(|existing| {
                    existing.first_seen_height = existing.first_seen_height.min(r.first_seen_height);
                })
                .or_insert_with(|| r.clone());
        }
        Ok(())
    }

    async fn upsert_staking_events(&self, rows: &[StakingEventRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner.staking_events.retain(|x| {
                !(x.transaction_id == r.transaction_id && x.event_index == r.event_index)
            });
            inner.staking_events.push(r.clone());
        }
        Ok(())
    }

    async fn upsert_staking_nodes(&self, rows: &[StakingNodeRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner.staking_nodes.insert(r.node_id.clone(), r.clone());
        }
        Ok(())
    }

    async fn upsert_epoch_stats(&self, rows: &[EpochStatsRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner.epoch_stats.insert(r.epoch, r.clone());
        }
        Ok(())
    }

    async fn upsert_defi_events(&self, rows: &[DefiEventRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner.defi_events.retain(|x| {
                !(x.transaction_id == r.transaction_id && x.event_index == r.event_index)
            });
            inner.defi_events.push(r.clone());
        }
        Ok(())
    }

    async fn upsert_defi_pairs(&self, rows: &[DefiPairRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner
                .defi_pairs
                .entry(r.pair_id.clone())
                .or_insert_with(|| r.clone());
        }
        Ok(())
    }

    async fn upsert_address_transactions(
        &self,
        rows: &[AddressTransactionRow],
    ) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner.address_transactions.insert(
                (r.address.clone(), r.transaction_id.clone(), r.role.clone()),
                r.clone(),
            );
        }
        Ok(())
    }

    async fn upsert_tx_contracts(&self, rows: &[TxContractRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner
                .tx_contracts
                .insert((r.transaction_id.clone(), r.contract_id.clone()), r.clone());
        }
        Ok(())
    }

    async fn upsert_tx_tags(&self, rows: &[TxTagRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner
                .tx_tags
                .insert((r.transaction_id.clone(), r.tag.clone()), r.clone());
        }
        Ok(())
    }

    async fn upsert_token_metadata(&self, rows: &[TokenMetadataRow]) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        for r in rows {
            inner.token_metadata.insert(r.contract_id.clone(), r.clone());
        }
        Ok(())
    }

    async fn backfill_address_transactions_and_stats_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<(), BoxError> {
        self.inner
            .lock()
            .unwrap()
            .backfill_calls
            .push(("address_tx_stats".to_string(), from, to));
        Ok(())
    }

    async fn backfill_tx_metrics_range(&self, from: u64, to: u64) -> Result<(), BoxError> {
        self.inner
            .lock()
            .unwrap()
            .backfill_calls
            .push(("tx_metrics".to_string(), from, to));
        Ok(())
    }

    async fn refresh_daily_stats_range(&self, from: u64, to: u64) -> Result<(), BoxError> {
        self.inner
            .lock()
            .unwrap()
            .backfill_calls
            .push(("daily_stats".to_string(), from, to));
        Ok(())
    }

    async fn refresh_analytics_daily_metrics_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<(), BoxError> {
        self.inner
            .lock()
            .unwrap()
            .backfill_calls
            .push(("analytics_daily".to_string(), from, to));
        Ok(())
    }

    async fn list_ft_tokens_missing_metadata(&self, limit: u64) -> Result<Vec<String>, BoxError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .contract_registry
            .values()
            .filter(|r| !r.is_nft && !inner.token_metadata.contains_key(&r.contract_id))
            .map(|r| r.contract_id.clone())
            .take(limit as usize)
            .collect())
    }

    async fn list_nft_tokens_missing_metadata(&self, limit: u64) -> Result<Vec<String>, BoxError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .contract_registry
            .values()
            .filter(|r| r.is_nft && !inner.token_metadata.contains_key(&r.contract_id))
            .map(|r| r.contract_id.clone())
            .take(limit as usize)
            .collect())
    }

    async fn list_top_owner_collections(
        &self,
        limit: u64,
    ) -> Result<Vec<(String, String)>, BoxError> {
        let inner = self.inner.lock().unwrap();
        let mut counts: HashMap<(String, String), u64> = HashMap::new();
        for o in inner.nft_ownership.values() {
            *counts
                .entry((o.contract_id.clone(), o.owner.clone()))
                .or_default() += 1;
        }
        let mut pairs: Vec<_> = counts.into_iter().collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(pairs
            .into_iter()
            .take(limit as usize)
            .map(|(k, _)| k)
            .collect())
    }

    async fn list_nft_ownership(
        &self,
        contract_id: &str,
        owner: &str,
        limit: u64,
    ) -> Result<Vec<NftOwnership>, BoxError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .nft_ownership
            .values()
            .filter(|o| o.contract_id == contract_id && o.owner == owner)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_last_indexed_height(&self, name: &str) -> Result<Option<u64>, BoxError> {
        Ok(self.inner.lock().unwrap().checkpoints.get(name).copied())
    }

    async fn update_checkpoint(&self, name: &str, height: u64) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        inner.checkpoints.insert(name.to_string(), height);
        Ok(())
    }

    async fn advance_checkpoint_safe(&self, name: &str) -> Result<u64, BoxError> {
        let mut inner = self.inner.lock().unwrap();
        let mut checkpoint = inner.checkpoints.get(name).copied().unwrap_or(0);
        loop {
            let next = inner.leases.iter().find(|l| {
                l.worker_type == name
                    && l.status == LeaseStatus::Completed
                    && l.from_height == checkpoint
            });
            match next {
                Some(l) => checkpoint = l.to_height,
                None => break,
            }
        }
        inner.checkpoints.insert(name.to_string(), checkpoint);
        Ok(checkpoint)
    }

    async fn acquire_lease(
        &self,
        worker_type: &str,
        from: u64,
        to: u64,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<u64, BoxError> {
        let mut inner = self.inner.lock().unwrap();
        let exists = inner
            .leases
            .iter()
            .any(|l| l.worker_type == worker_type && l.from_height == from && l.to_height == to);
        if exists {
            return Ok(0);
        }
        inner.next_lease_id += 1;
        let id = inner.next_lease_id;
        inner.leases.push(Lease {
            id,
            worker_type: worker_type.to_string(),
            from_height: from,
            to_height: to,
            status: LeaseStatus::Active,
            worker_id: worker_id.to_string(),
            acquired_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::from_std(ttl).unwrap_or_default(),
            attempt: 1,
            last_error: None,
        });
        Ok(id)
    }

    async fn reclaim_lease(
        &self,
        worker_type: &str,
        from: u64,
        to: u64,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<u64, BoxError> {
        let mut inner = self.inner.lock().unwrap();
        let lease = inner.leases.iter_mut().find(|l| {
            l.worker_type == worker_type && l.from_height == from && l.to_height == to
        });
        match lease {
            Some(l) if l.status == LeaseStatus::Failed => {
                l.status = LeaseStatus::Active;
                l.worker_id = worker_id.to_string();
                l.acquired_at = Utc::now();
                l.expires_at = Utc::now() + ChronoDuration::from_std(ttl).unwrap_or_default();
                l.attempt += 1;
                Ok(l.id)
            }
            _ => Ok(0),
        }
    }

    async fn complete_lease(&self, lease_id: u64) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(l) = inner.leases.iter_mut().find(|l| l.id == lease_id) {
            l.status = LeaseStatus::Completed;
        }
        Ok(())
    }

    async fn fail_lease(&self, lease_id: u64, error: &str) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(l) = inner.leases.iter_mut().find(|l| l.id == lease_id) {
            l.status = LeaseStatus::Failed;
            l.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn reap_expired_leases(&self) -> Result<u64, BoxError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut reaped = 0;
        for l in inner.leases.iter_mut() {
            if l.status == LeaseStatus::Active && l.expires_at < now {
                l.status = LeaseStatus::Failed;
                l.last_error = Some("expired".to_string());
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn detect_lease_gaps(&self, worker_type: &str) -> Result<Vec<LeaseGap>, BoxError> {
        let inner = self.inner.lock().unwrap();
        let mut completed: Vec<&Lease> = inner
            .leases
            .iter()
            .filter(|l| l.worker_type == worker_type && l.status == LeaseStatus::Completed)
            .collect();
        completed.sort_by_key(|l| l.from_height);
        let mut gaps = Vec::new();
        for pair in completed.windows(2) {
            if pair[1].from_height > pair[0].to_height {
                gaps.push(LeaseGap {
                    from_height: pair[0].to_height,
                    to_height: pair[1].from_height,
                });
            }
        }
        Ok(gaps)
    }

    async fn count_dead_leases(&self) -> Result<u64, BoxError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .leases
            .iter()
            .filter(|l| l.status == LeaseStatus::Failed && l.attempt >= DEAD_LEASE_ATTEMPTS)
            .count() as u64)
    }

    async fn log_indexing_error(
        &self,
        worker_type: &str,
        block_height: u64,
        kind: &str,
        message: &str,
    ) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_error_id += 1;
        let id = inner.next_error_id;
        inner.errors.push(IndexingErrorRow {
            id,
            worker_type: worker_type.to_string(),
            block_height,
            kind: kind.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
            resolved_at: None,
        });
        Ok(())
    }

    async fn list_unresolved_errors_by_worker(
        &self,
        worker_type: &str,
        limit: u64,
    ) -> Result<Vec<IndexingErrorRow>, BoxError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<IndexingErrorRow> = inner
            .errors
            .iter()
            .filter(|e| e.worker_type == worker_type && e.resolved_at.is_none())
            .cloned()
            .collect();
        out.sort_by_key(|e| e.block_height);
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn resolve_errors_in_range(
        &self,
        worker_type: &str,
        from: u64,
        to: u64,
    ) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        for e in inner.errors.iter_mut() {
            if e.worker_type == worker_type
                && e.resolved_at.is_none()
                && e.block_height >= from
                && e.block_height < to
            {
                e.resolved_at = Some(now);
            }
        }
        Ok(())
    }
}

