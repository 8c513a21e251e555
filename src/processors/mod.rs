//! Processor implementations
//!
//! One module per derivation family. `build_registry` wires the full
//! production set in registration order; engines pick subsets by name.

pub mod accounts;
pub mod daily_stats;
pub mod defi;
pub mod evm;
pub mod holdings;
pub mod meta;
pub mod reconciler;
pub mod staking;
pub mod token_metadata;
pub mod token_transfers;
pub mod tx_contracts;

use std::sync::Arc;

use crate::processor::{ProcessorContext, ProcessorRegistry};

/// The full production processor set.
pub fn build_registry(ctx: ProcessorContext) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();
    registry.register(Arc::new(token_transfers::TokenTransferProcessor::new(
        ctx.clone(),
    )));
    registry.register(Arc::new(holdings::FtHoldingsProcessor::new(ctx.clone())));
    registry.register(Arc::new(holdings::NftOwnershipProcessor::new(ctx.clone())));
    registry.register(Arc::new(holdings::DailyBalanceProcessor::new(ctx.clone())));
    registry.register(Arc::new(accounts::AccountsProcessor::new(ctx.clone())));
    registry.register(Arc::new(evm::EvmProcessor::new(ctx.clone())));
    registry.register(Arc::new(meta::MetaProcessor::new(ctx.clone())));
    registry.register(Arc::new(tx_contracts::TxContractsProcessor::new(
        ctx.clone(),
    )));
    registry.register(Arc::new(staking::StakingProcessor::new(ctx.clone())));
    registry.register(Arc::new(defi::DefiProcessor::new(ctx.clone())));
    registry.register(Arc::new(daily_stats::DailyStatsProcessor::new(ctx.clone())));
    registry.register(Arc::new(token_metadata::TokenMetadataProcessor::new(
        ctx.clone(),
    )));
    registry.register(Arc::new(reconciler::NftReconcilerProcessor::new(ctx)));
    registry
}
