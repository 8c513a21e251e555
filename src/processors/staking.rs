//! Staking aggregator
//!
//! Extracts FlowIDTableStaking delegation/reward/node-lifecycle events
//! into the staking tables, tracks known nodes, and folds epoch total
//! reward payouts into per-epoch stats.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::BoxError;
use crate::processor::{Processor, ProcessorContext, STAKING_WORKER};
use crate::types::{EpochStatsRow, Event, StakingEventRow, StakingNodeRow};

/// Event names of interest on the staking contract.
const STAKING_EVENTS: &[&str] = &[
    "NewNodeCreated",
    "TokensCommitted",
    "TokensStaked",
    "TokensUnstaked",
    "NewDelegatorCreated",
    "DelegatorTokensCommitted",
    "RewardsPaid",
    "DelegatorRewardsPaid",
    "NodeRemovedAndRefunded",
];

fn event_name(event_type: &str) -> &str {
    event_type.rsplit('.').next().unwrap_or("")
}

pub struct StakingProcessor {
    ctx: ProcessorContext,
}

impl StakingProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }

    fn staking_row(event: &Event) -> Option<StakingEventRow> {
        let name = event_name(&event.event_type);
        if !STAKING_EVENTS.contains(&name) {
            return None;
        }
        let node_id = event.payload_str("nodeID").unwrap_or_default();
        if node_id.is_empty() {
            return None;
        }
        Some(StakingEventRow {
            event_type: name.to_string(),
            node_id,
            delegator_id: event
                .payload_str("delegatorID")
                .and_then(|d| d.parse().ok()),
            amount: event
                .payload_str("amount")
                .or_else(|| event.payload_str("tokensCommitted"))
                .unwrap_or_default(),
            block_height: event.block_height,
            transaction_id: event.transaction_id.clone(),
            event_index: event.event_index,
        })
    }
}

#[async_trait]
impl Processor for StakingProcessor {
    fn name(&self) -> &'static str {
        STAKING_WORKER
    }

    async fn process_range(
        &self,
        from: u64,
        to: u64,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let repo = &self.ctx.repository;
        let staking_address = crate::address::normalize_flow_address(&config::staking_address());
        let events = repo.get_raw_events_in_range(from, to).await?;

        let mut event_rows: Vec<StakingEventRow> = Vec::new();
        let mut nodes: HashMap<String, StakingNodeRow> = HashMap::new();
        let mut epochs: Vec<EpochStatsRow> = Vec::new();

        for event in &events {
            // Only the configured staking contract's events count.
            if event.contract_address() != staking_address {
                continue;
            }
            if event.contract_name() == "FlowIDTableStaking" {
                if let Some(row) = Self::staking_row(event) {
                    nodes
                        .entry(row.node_id.clone())
                        .and_modify(|n| n.last_event_height = n.last_event_height.max(row.block_height))
                        .or_insert_with(|| StakingNodeRow {
                            node_id: row.node_id.clone(),
                            role: event.payload_str("role").and_then(|r| r.parse().ok()),
                            last_event_height: row.block_height,
                        });
                    event_rows.push(row);
                }
            } else if event.contract_name() == "FlowEpoch"
                && event_name(&event.event_type) == "EpochTotalRewardsPaid"
            {
                let epoch = event
                    .payload_str("epochCounter")
                    .and_then(|e| e.parse().ok())
                    .unwrap_or(0);
                epochs.push(EpochStatsRow {
                    epoch,
                    total_staked: event.payload_str("totalStaked").unwrap_or_default(),
                    total_rewarded: event
                        .payload_str("total")
                        .or_else(|| event.payload_str("totalRewards"))
                        .unwrap_or_default(),
                    block_height: event.block_height,
                });
            }
        }

        if !event_rows.is_empty() {
            repo.upsert_staking_events(&event_rows).await?;
        }
        if !nodes.is_empty() {
            let mut rows: Vec<StakingNodeRow> = nodes.into_values().collect();
            rows.sort_by(|a, b| a.node_id.cmp(&b.node_id));
            repo.upsert_staking_nodes(&rows).await?;
        }
        if !epochs.is_empty() {
            repo.upsert_epoch_stats(&epochs).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PinnedPool;
    use crate::repository::Repository;
    use crate::testutil::*;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(repo: &Arc<MemoryRepository>) -> ProcessorContext {
        crate::config::init_empty_for_tests();
        ProcessorContext::new(
            Arc::clone(repo) as Arc<dyn Repository>,
            Arc::new(PinnedPool::new(vec![])),
        )
    }

    #[tokio::test]
    async fn test_staking_events_extracted() {
        let repo = Arc::new(MemoryRepository::new());
        let mut staked = make_event(
            &tx_id_for(1),
            100,
            0,
            "A.8624b52f9ddcd04a.FlowIDTableStaking.TokensStaked",
        );
        staked.payload = json!({"nodeID": "abc123", "amount": "1350000.0"});
        // Wrong contract address: ignored.
        let mut foreign = make_event(
            &tx_id_for(2),
            100,
            0,
            "A.0000000000000001.FlowIDTableStaking.TokensStaked",
        );
        foreign.payload = json!({"nodeID": "zzz", "amount": "1.0"});
        repo.seed_events(vec![staked, foreign]);

        let processor = StakingProcessor::new(ctx(&repo));
        processor
            .process_range(100, 101, &CancellationToken::new())
            .await
            .unwrap();

        let events = repo.staking_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].node_id, "abc123");
        assert_eq!(events[0].event_type, "TokensStaked");
        assert_eq!(events[0].amount, "1350000.0");
    }

    #[tokio::test]
    async fn test_epoch_rewards_fold_into_stats() {
        let repo = Arc::new(MemoryRepository::new());
        let mut rewards = make_event(
            &tx_id_for(1),
            200,
            0,
            "A.8624b52f9ddcd04a.FlowEpoch.EpochTotalRewardsPaid",
        );
        rewards.payload = json!({"epochCounter": "42", "total": "1297108.0"});
        repo.seed_events(vec![rewards]);

        let processor = StakingProcessor::new(ctx(&repo));
        processor
            .process_range(200, 201, &CancellationToken::new())
            .await
            .unwrap();

        let stats = repo.epoch_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].epoch, 42);
        assert_eq!(stats[0].total_rewarded, "1297108.0");
        assert!(repo.staking_events().is_empty());
    }

    #[tokio::test]
    async fn test_delegator_id_parsed() {
        let repo = Arc::new(MemoryRepository::new());
        let mut ev = make_event(
            &tx_id_for(1),
            100,
            0,
            "A.8624b52f9ddcd04a.FlowIDTableStaking.DelegatorRewardsPaid",
        );
        ev.payload = json!({"nodeID": "abc", "delegatorID": "7", "amount": "12.5"});
        repo.seed_events(vec![ev]);

        let processor = StakingProcessor::new(ctx(&repo));
        processor
            .process_range(100, 101, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(repo.staking_events()[0].delegator_id, Some(7));
    }
}
