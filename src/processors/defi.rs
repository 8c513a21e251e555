//! DEX event extraction
//!
//! Swap and liquidity events from the AMM pair contracts, plus the
//! pair registry fed by PairCreated events. The pair id is the emitting
//! contract's id; amounts are kept as the decimal strings the events
//! carry.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;
use crate::processor::{Processor, ProcessorContext, DEFI_WORKER};
use crate::types::{DefiEventRow, DefiPairRow, Event};

fn event_name(event_type: &str) -> &str {
    event_type.rsplit('.').next().unwrap_or("")
}

/// Swap/liquidity classification by event name.
fn defi_kind(name: &str) -> Option<&'static str> {
    match name {
        "Swap" | "TokensSwapped" => Some("SWAP"),
        "AddLiquidity" | "LiquidityAdded" => Some("ADD_LIQUIDITY"),
        "RemoveLiquidity" | "LiquidityRemoved" => Some("REMOVE_LIQUIDITY"),
        _ => None,
    }
}

pub struct DefiProcessor {
    ctx: ProcessorContext,
}

impl DefiProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }

    fn defi_row(event: &Event, kind: &'static str) -> DefiEventRow {
        // Swap events publish either netted in/out legs or plain
        // amount0/amount1.
        let amount0 = event
            .payload_str("amount0In")
            .or_else(|| event.payload_str("amount0"))
            .or_else(|| event.payload_str("token1Amount"))
            .unwrap_or_default();
        let amount1 = event
            .payload_str("amount1Out")
            .or_else(|| event.payload_str("amount1"))
            .or_else(|| event.payload_str("token2Amount"))
            .unwrap_or_default();
        DefiEventRow {
            pair_id: event.contract_id(),
            kind: kind.to_string(),
            amount0,
            amount1,
            block_height: event.block_height,
            transaction_id: event.transaction_id.clone(),
            event_index: event.event_index,
        }
    }
}

#[async_trait]
impl Processor for DefiProcessor {
    fn name(&self) -> &'static str {
        DEFI_WORKER
    }

    async fn process_range(
        &self,
        from: u64,
        to: u64,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let repo = &self.ctx.repository;
        let events = repo.get_raw_events_in_range(from, to).await?;

        let mut event_rows: Vec<DefiEventRow> = Vec::new();
        let mut pair_rows: Vec<DefiPairRow> = Vec::new();

        for event in &events {
            // Pair contracts follow the SwapPair naming convention.
            let is_pair_contract = event.contract_name().contains("SwapPair")
                || event.contract_name().contains("SwapFactory");
            if !is_pair_contract {
                continue;
            }
            let name = event_name(&event.event_type);
            if let Some(kind) = defi_kind(name) {
                event_rows.push(Self::defi_row(event, kind));
            } else if name == "PairCreated" {
                pair_rows.push(DefiPairRow {
                    pair_id: event
                        .payload_str("pairAddress")
                        .map(|a| crate::address::normalize_flow_address(&a))
                        .filter(|a| !a.is_empty())
                        .map(|a| format!("A.{}.SwapPair", a))
                        .unwrap_or_else(|| event.contract_id()),
                    contract_address: event.contract_address(),
                    token0: event.payload_str("token0Key").unwrap_or_default(),
                    token1: event.payload_str("token1Key").unwrap_or_default(),
                    first_seen_height: event.block_height,
                });
            }
        }

        if !event_rows.is_empty() {
            repo.upsert_defi_events(&event_rows).await?;
        }
        if !pair_rows.is_empty() {
            repo.upsert_defi_pairs(&pair_rows).await?;
        }
        Ok(())
    }
}
