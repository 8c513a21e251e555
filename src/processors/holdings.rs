//! Holdings-family processors
//!
//! Consumers of the token transfer builder's output: FT balance
//! deltas, NFT ownership, and per-day balance deltas. All three run in
//! the second derivation phase and as single-instance async workers so
//! ordering within a range is deterministic.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::BoxError;
use crate::processor::{
    Processor, ProcessorContext, DAILY_BALANCE_WORKER, FT_HOLDINGS_WORKER, NFT_OWNERSHIP_WORKER,
};
use crate::types::{DailyBalanceDelta, FtHoldingDelta, NftOwnership, TokenTransfer};

/// Applies signed balance deltas from FT transfers. Delta rows are
/// keyed by (address, contract, height) so a re-run replaces rather
/// than double-counts.
pub struct FtHoldingsProcessor {
    ctx: ProcessorContext,
}

impl FtHoldingsProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }
}

/// Per-(address, contract, height) signed sums for a transfer set.
fn aggregate_deltas(transfers: &[TokenTransfer]) -> Vec<FtHoldingDelta> {
    let mut sums: BTreeMap<(String, String, u64), (String, BigDecimal)> = BTreeMap::new();
    for transfer in transfers {
        let amount = match BigDecimal::from_str(&transfer.amount) {
            Ok(a) => a,
            Err(_) => continue,
        };
        if !transfer.from_address.is_empty() {
            let entry = sums
                .entry((
                    transfer.from_address.clone(),
                    transfer.contract_id.clone(),
                    transfer.block_height,
                ))
                .or_insert_with(|| (transfer.contract_name.clone(), BigDecimal::default()));
            entry.1 -= &amount;
        }
        if !transfer.to_address.is_empty() {
            let entry = sums
                .entry((
                    transfer.to_address.clone(),
                    transfer.contract_id.clone(),
                    transfer.block_height,
                ))
                .or_insert_with(|| (transfer.contract_name.clone(), BigDecimal::default()));
            entry.1 += &amount;
        }
    }
    sums.into_iter()
        .map(
            |((address, contract_id, block_height), (contract_name, delta))| FtHoldingDelta {
                address,
                contract_id,
                contract_name,
                delta: delta.normalized().to_string(),
                block_height,
            },
        )
        .collect()
}

#[async_trait]
impl Processor for FtHoldingsProcessor {
    fn name(&self) -> &'static str {
        FT_HOLDINGS_WORKER
    }

    async fn process_range(
        &self,
        from: u64,
        to: u64,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let transfers = self
            .ctx
            .repository
            .get_ft_transfers_in_range(from, to)
            .await?;
        let deltas = aggregate_deltas(&transfers);
        if !deltas.is_empty() {
            self.ctx.repository.upsert_ft_holdings_delta(&deltas).await?;
        }
        Ok(())
    }
}

/// Tracks the latest owner of each NFT. Deposits to custodial escrow
/// addresses do not change attribution; burns clear the row.
pub struct NftOwnershipProcessor {
    ctx: ProcessorContext,
}

impl NftOwnershipProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Processor for NftOwnershipProcessor {
    fn name(&self) -> &'static str {
        NFT_OWNERSHIP_WORKER
    }

    async fn process_range(
        &self,
        from: u64,
        to: u64,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let transfers = self
            .ctx
            .repository
            .get_nft_transfers_in_range(from, to)
            .await?;
        if transfers.is_empty() {
            return Ok(());
        }
        let custodial = config::nft_custodial_addresses();

        // Latest movement per (contract, nft) wins; input is ordered.
        let mut latest: BTreeMap<(String, String), &TokenTransfer> = BTreeMap::new();
        for transfer in &transfers {
            if transfer.nft_id.is_empty() {
                continue;
            }
            if custodial.contains(&transfer.to_address) {
                continue;
            }
            latest.insert(
                (transfer.contract_id.clone(), transfer.nft_id.clone()),
                transfer,
            );
        }

        let mut upserts: Vec<NftOwnership> = Vec::new();
        for ((contract_id, nft_id), transfer) in latest {
            if transfer.to_address.is_empty() {
                // Burn: the token left circulation.
                self.ctx
                    .repository
                    .delete_nft_ownership(&contract_id, &nft_id)
                    .await?;
            } else {
                upserts.push(NftOwnership {
                    contract_id,
                    contract_name: transfer.contract_name.clone(),
                    nft_id,
                    owner: transfer.to_address.clone(),
                    block_height: transfer.block_height,
                    transaction_id: transfer.transaction_id.clone(),
                });
            }
        }
        if !upserts.is_empty() {
            self.ctx.repository.upsert_nft_ownership(&upserts).await?;
        }
        Ok(())
    }
}

/// Daily balance deltas keyed by (address, contract, date).
pub struct DailyBalanceProcessor {
    ctx: ProcessorContext,
}

impl DailyBalanceProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Processor for DailyBalanceProcessor {
    fn name(&self) -> &'static str {
        DAILY_BALANCE_WORKER
    }

    async fn process_range(
        &self,
        from: u64,
        to: u64,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let transfers = self
            .ctx
            .repository
            .get_ft_transfers_in_range(from, to)
            .await?;
        if transfers.is_empty() {
            return Ok(());
        }

        let mut sums: BTreeMap<(String, String, NaiveDate), (String, BigDecimal)> =
            BTreeMap::new();
        for transfer in &transfers {
            let amount = match BigDecimal::from_str(&transfer.amount) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let date = transfer.timestamp.date_naive();
            if !transfer.from_address.is_empty() {
                let entry = sums
                    .entry((transfer.from_address.clone(), transfer.contract_id.clone(), date))
                    .or_insert_with(|| (transfer.contract_name.clone(), BigDecimal::default()));
                entry.1 -= &amount;
            }
            if !transfer.to_address.is_empty() {
                let entry = sums
                    .entry((transfer.to_address.clone(), transfer.contract_id.clone(), date))
                    .or_insert_with(|| (transfer.contract_name.clone(), BigDecimal::default()));
                entry.1 += &amount;
            }
        }

        let rows: Vec<DailyBalanceDelta> = sums
            .into_iter()
            .map(|((address, contract_id, date), (contract_name, delta))| DailyBalanceDelta {
                address,
                contract_id,
                contract_name,
                date,
                delta: delta.normalized().to_string(),
            })
            .collect();
        self.ctx.repository.upsert_daily_balance_delta(&rows).await?;
        Ok(())
    }
}
