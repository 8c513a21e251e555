//! Accounts catalog
//!
//! Collects every address that appears on-chain: `flow.AccountCreated`
//! events plus the payer/proposer/authorizer columns of raw
//! transactions, with first/last-seen heights. Also extracts
//! Cadence-owned EVM accounts (COAs), attributing each to the Flow
//! account that signed the creating transaction.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::address::{normalize_evm_address, normalize_flow_address};
use crate::error::BoxError;
use crate::processor::{Processor, ProcessorContext, ACCOUNTS_WORKER};
use crate::types::{AccountRow, CoaAccountRow, Transaction};

pub struct AccountsProcessor {
    ctx: ProcessorContext,
}

impl AccountsProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }
}

fn track(seen: &mut HashMap<String, AccountRow>, address: String, height: u64) {
    if address.is_empty() || address == crate::address::ZERO_ADDRESS {
        return;
    }
    seen.entry(address.clone())
        .and_modify(|row| {
            row.first_seen_height = row.first_seen_height.min(height);
            row.last_seen_height = row.last_seen_height.max(height);
        })
        .or_insert(AccountRow {
            address,
            first_seen_height: height,
            last_seen_height: height,
        });
}

/// The Flow account behind a COA creation: first authorizer, falling
/// back to payer, then proposer.
fn coa_owner(tx: &Transaction) -> String {
    tx.authorizers
        .first()
        .filter(|a| !a.is_empty())
        .cloned()
        .unwrap_or_else(|| {
            if !tx.payer.is_empty() {
                tx.payer.clone()
            } else {
                tx.proposer.clone()
            }
        })
}

#[async_trait]
impl Processor for AccountsProcessor {
    fn name(&self) -> &'static str {
        ACCOUNTS_WORKER
    }

    async fn process_range(
        &self,
        from: u64,
        to: u64,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let repo = &self.ctx.repository;
        let events = repo.get_raw_events_in_range(from, to).await?;
        let transactions = repo.get_raw_transactions_in_range(from, to).await?;
        let tx_by_id: HashMap<&str, &Transaction> =
            transactions.iter().map(|t| (t.id.as_str(), t)).collect();

        let mut seen: HashMap<String, AccountRow> = HashMap::new();
        let mut coas: Vec<CoaAccountRow> = Vec::new();

        for event in &events {
            if event.event_type == "flow.AccountCreated" {
                if let Some(address) = event.payload_str("address") {
                    track(&mut seen, normalize_flow_address(&address), event.block_height);
                }
            } else if event.event_type.contains("EVM.CadenceOwnedAccountCreated") {
                let evm_address = event
                    .payload_str("address")
                    .map(|a| normalize_evm_address(&a))
                    .unwrap_or_default();
                if evm_address.is_empty() {
                    continue;
                }
                let flow_address = tx_by_id
                    .get(event.transaction_id.as_str())
                    .map(|tx| coa_owner(tx))
                    .unwrap_or_default();
                coas.push(CoaAccountRow {
                    evm_address,
                    flow_address,
                    block_height: event.block_height,
                    transaction_id: event.transaction_id.clone(),
                });
            }
        }

        for tx in &transactions {
            track(&mut seen, tx.proposer.clone(), tx.block_height);
            track(&mut seen, tx.payer.clone(), tx.block_height);
            for authorizer in &tx.authorizers {
                track(&mut seen, authorizer.clone(), tx.block_height);
            }
        }

        if !seen.is_empty() {
            let mut rows: Vec<AccountRow> = seen.into_values().collect();
            rows.sort_by(|a, b| a.address.cmp(&b.address));
            repo.upsert_accounts(&rows).await?;
        }
        if !coas.is_empty() {
            repo.upsert_coa_accounts(&coas).await?;
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
    async fn test_account_created_event() {
        // S1: a created account lands in the catalog with both seen
        // heights at the creating block.
        let repo = Arc::new(MemoryRepository::new());
        let mut ev = make_event(&tx_id_for(1), 100, 0, "flow.AccountCreated");
        ev.payload = json!({"address": "0x1E3C78C6D580273B"});
        repo.seed_events(vec![ev]);

        let processor = AccountsProcessor::new(ctx(&repo));
        processor
            .process_range(100, 101, &CancellationToken::new())
            .await
            .unwrap();

        let accounts = repo.accounts();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].address, "1e3c78c6d580273b");
        assert_eq!(accounts[0].first_seen_height, 100);
        assert_eq!(accounts[0].last_seen_height, 100);
    }

    #[tokio::test]
    async fn test_signer_addresses_tracked_with_min_max() {
        let repo = Arc::new(MemoryRepository::new());
        let mut early = make_transaction(&tx_id_for(1), 100);
        early.payer = "000000000000aaaa".to_string();
        let mut late = make_transaction(&tx_id_for(2), 105);
        late.payer = "000000000000aaaa".to_string();
        repo.seed_transactions(vec![early, late]);

        let processor = AccountsProcessor::new(ctx(&repo));
        processor
            .process_range(100, 110, &CancellationToken::new())
            .await
            .unwrap();

        let row = repo
            .accounts()
            .into_iter()
            .find(|a| a.address == "000000000000aaaa")
            .unwrap();
        assert_eq!(row.first_seen_height, 100);
        assert_eq!(row.last_seen_height, 105);
    }

    #[tokio::test]
    async fn test_coa_owner_resolution() {
        let repo = Arc::new(MemoryRepository::new());
        let mut tx = make_transaction(&tx_id_for(1), 100);
        tx.authorizers = vec!["000000000000bbbb".to_string()];
        repo.seed_transactions(vec![tx]);
        let mut ev = make_event(
            &tx_id_for(1),
            100,
            0,
            "A.e467b9dd11fa00df.EVM.CadenceOwnedAccountCreated",
        );
        ev.payload = json!({"address": "0x00000000000000000000000228fCdfE27634b2aE"});
        repo.seed_events(vec![ev]);

        let processor = AccountsProcessor::new(ctx(&repo));
        processor
            .process_range(100, 101, &CancellationToken::new())
            .await
            .unwrap();

        let coas = repo.coa_accounts();
        assert_eq!(coas.len(), 1);
        assert_eq!(coas[0].evm_address, "00000000000000000000000228fcdfe27634b2ae");
        assert_eq!(coas[0].flow_address, "000000000000bbbb");
    }

    #[tokio::test]
    async fn test_coa_falls_back_to_payer() {
        let repo = Arc::new(MemoryRepository::new());
        let mut tx = make_transaction(&tx_id_for(1), 100);
        tx.authorizers = vec![];
        tx.payer = "000000000000cccc".to_string();
        repo.seed_transactions(vec![tx]);
        let mut ev = make_event(
            &tx_id_for(1),
            100,
            0,
            "A.e467b9dd11fa00df.EVM.CadenceOwnedAccountCreated",
        );
        ev.payload = json!({"address": "0xabcdef"});
        repo.seed_events(vec![ev]);

        let processor = AccountsProcessor::new(ctx(&repo));
        processor
            .process_range(100, 101, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(repo.coa_accounts()[0].flow_address, "000000000000cccc");
    }
}
