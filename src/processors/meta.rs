//! Meta worker
//!
//! The grab-bag of per-address materializations: the SQL-side
//! address-transaction and stats backfills, account key add/remove
//! extraction, and the contract registry fed by
//! `flow.AccountContractAdded/Updated` events, with opportunistic
//! contract source fetch from an access node.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::normalize_flow_address;
use crate::config;
use crate::error::BoxError;
use crate::processor::{Processor, ProcessorContext, META_WORKER};
use crate::types::{AccountKeyAction, AccountKeyRow, ContractAction, Event, SmartContractRow};

pub struct MetaProcessor {
    ctx: ProcessorContext,
}

impl MetaProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }
}

/// Key index from the payload: `keyIndex` normally, nested inside the
/// legacy `publicKey` struct on old removal events.
fn extract_key_index(event: &Event) -> Option<u32> {
    if let Some(v) = event.payload_str("keyIndex") {
        if let Ok(i) = v.parse() {
            return Some(i);
        }
    }
    event
        .payload
        .get("publicKey")
        .and_then(|pk| pk.get("keyIndex"))
        .and_then(|v| match v {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().map(|x| x as u32),
            _ => None,
        })
}

fn extract_public_key(event: &Event) -> Option<String> {
    match event.payload.get("publicKey") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(obj @ serde_json::Value::Object(_)) => obj
            .get("publicKey")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| Some(obj.to_string())),
        _ => None,
    }
}

fn account_key_row(event: &Event, action: AccountKeyAction) -> Option<AccountKeyRow> {
    let address = normalize_flow_address(&event.payload_str("address")?);
    if address.is_empty() {
        return None;
    }
    let key_index = extract_key_index(event)?;
    Some(AccountKeyRow {
        address,
        key_index,
        public_key: extract_public_key(event),
        action,
        block_height: event.block_height,
        transaction_id: event.transaction_id.clone(),
    })
}

#[async_trait]
impl Processor for MetaProcessor {
    fn name(&self) -> &'static str {
        META_WORKER
    }

    async fn process_range(
        &self,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let repo = &self.ctx.repository;

        repo.backfill_address_transactions_and_stats_range(from, to)
            .await?;
        repo.backfill_tx_metrics_range(from, to).await?;

        let events = repo.get_raw_events_in_range(from, to).await?;

        let mut key_rows: Vec<AccountKeyRow> = Vec::new();
        let mut contract_rows: Vec<SmartContractRow> = Vec::new();
        for event in &events {
            match event.event_type.as_str() {
                "flow.AccountKeyAdded" => {
                    match account_key_row(event, AccountKeyAction::Added) {
                        Some(row) => key_rows.push(row),
                        None => debug!(
                            height = event.block_height,
                            "AccountKeyAdded without key index; skipped"
                        ),
                    }
                }
                "flow.AccountKeyRemoved" => {
                    match account_key_row(event, AccountKeyAction::Removed) {
                        Some(row) => key_rows.push(row),
                        None => debug!(
                            height = event.block_height,
                            "AccountKeyRemoved without key index; skipped"
                        ),
                    }
                }
                "flow.AccountContractAdded" | "flow.AccountContractUpdated" => {
                    let address = event
                        .payload_str("address")
                        .map(|a| normalize_flow_address(&a))
                        .unwrap_or_default();
                    let name = event.payload_str("contract").unwrap_or_default();
                    if address.is_empty() || name.is_empty() {
                        continue;
                    }
                    let action = if event.event_type.ends_with("Added") {
                        ContractAction::Added
                    } else {
                        ContractAction::Updated
                    };
                    contract_rows.push(SmartContractRow {
                        address,
                        name,
                        action,
                        code: None,
                        block_height: event.block_height,
                        transaction_id: event.transaction_id.clone(),
                    });
                }
                _ => {}
            }
        }

        if config::store_contract_code() && !contract_rows.is_empty() {
            self.fetch_contract_code(&mut contract_rows, cancel).await;
        }

        if !key_rows.is_empty() {
            repo.upsert_account_keys(&key_rows).await?;
        }
        if !contract_rows.is_empty() {
            repo.upsert_smart_contracts(&contract_rows).await?;
        }
        Ok(())
    }
}

impl MetaProcessor {
    /// Best effort: pull the contract source from the account state at
    /// the event's height. Capped per range; failures only log.
    async fn fetch_contract_code(
        &self,
        rows: &mut [SmartContractRow],
        cancel: &CancellationToken,
    ) {
        let Some(client) = self.ctx.pool.any_client() else {
            return;
        };
        let cap = config::contract_code_backfill_per_range() as usize;
        for row in rows.iter_mut().take(cap) {
            match client
                .get_account_at_block_height(&row.address, row.block_height, cancel)
                .await
            {
                Ok(account) => {
                    row.code = account.contracts.get(&row.name).cloned();
                }
                Err(e) => {
                    warn!(
                        address = %row.address,
                        contract = %row.name,
                        error = %e,
                        "contract code fetch failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_client::{Account, NodeClient};
    use crate::pool::PinnedPool;
    use crate::repository::Repository;
    use crate::testutil::*;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx_with_pool(repo: &Arc<MemoryRepository>, pool: PinnedPool) -> ProcessorContext {
        crate::config::init_empty_for_tests();
        ProcessorContext::new(Arc::clone(repo) as Arc<dyn Repository>, Arc::new(pool))
    }

    #[tokio::test]
    async fn test_backfills_called_for_range() {
        let repo = Arc::new(MemoryRepository::new());
        let processor = MetaProcessor::new(ctx_with_pool(&repo, PinnedPool::new(vec![])));
        processor
            .process_range(100, 200, &CancellationToken::new())
            .await
            .unwrap();
        let calls = repo.backfill_calls();
        assert!(calls.contains(&("address_tx_stats".to_string(), 100, 200)));
        assert!(calls.contains(&("tx_metrics".to_string(), 100, 200)));
    }

    #[tokio::test]
    async fn test_account_key_added_and_removed() {
        let repo = Arc::new(MemoryRepository::new());
        let mut added = make_event(&tx_id_for(1), 100, 0, "flow.AccountKeyAdded");
        added.payload = json!({"address": "0xaaaa", "keyIndex": "2", "publicKey": "abcd"});
        // Legacy removal: index nested in the publicKey struct.
        let mut removed = make_event(&tx_id_for(2), 101, 0, "flow.AccountKeyRemoved");
        removed.payload = json!({"address": "0xaaaa", "publicKey": {"keyIndex": "2", "publicKey": "abcd"}});
        // No index anywhere: skipped.
        let mut broken = make_event(&tx_id_for(3), 102, 0, "flow.AccountKeyAdded");
        broken.payload = json!({"address": "0xaaaa", "publicKey": "abcd"});
        repo.seed_events(vec![added, removed, broken]);

        let processor = MetaProcessor::new(ctx_with_pool(&repo, PinnedPool::new(vec![])));
        processor
            .process_range(100, 110, &CancellationToken::new())
            .await
            .unwrap();

        let keys = repo.account_keys();
        assert_eq!(keys.len(), 2);
        assert!(keys
            .iter()
            .any(|k| k.action == AccountKeyAction::Added && k.key_index == 2));
        assert!(keys
            .iter()
            .any(|k| k.action == AccountKeyAction::Removed && k.key_index == 2));
    }

    #[tokio::test]
    async fn test_contract_added_fetches_code() {
        let repo = Arc::new(MemoryRepository::new());
        let mut ev = make_event(&tx_id_for(1), 100, 0, "flow.AccountContractAdded");
        ev.payload = json!({"address": "0xbbbb", "contract": "Widget"});
        repo.seed_events(vec![ev]);

        let node = StubNodeClient::named("an-0");
        node.add_account(Account {
            address: "000000000000bbbb".to_string(),
            balance: 0,
            contracts: [("Widget".to_string(), "access(all) contract Widget {}".to_string())]
                .into_iter()
                .collect(),
        });
        let pool = PinnedPool::new(vec![Arc::new(node) as Arc<dyn NodeClient>]);

        let processor = MetaProcessor::new(ctx_with_pool(&repo, pool));
        processor
            .process_range(100, 101, &CancellationToken::new())
            .await
            .unwrap();

        let contracts = repo.smart_contracts();
        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].name, "Widget");
        assert_eq!(contracts[0].action, ContractAction::Added);
        assert_eq!(
            contracts[0].code.as_deref(),
            Some("access(all) contract Widget {}")
        );
    }

    #[tokio::test]
    async fn test_code_fetch_failure_is_not_fatal() {
        let repo = Arc::new(MemoryRepository::new());
        let mut ev = make_event(&tx_id_for(1), 100, 0, "flow.AccountContractUpdated");
        ev.payload = json!({"address": "0xbbbb", "contract": "Widget"});
        repo.seed_events(vec![ev]);

        // Node knows no accounts: fetch fails, row still lands.
        let node = StubNodeClient::named("an-0");
        let pool = PinnedPool::new(vec![Arc::new(node) as Arc<dyn NodeClient>]);
        let processor = MetaProcessor::new(ctx_with_pool(&repo, pool));
        processor
            .process_range(100, 101, &CancellationToken::new())
            .await
            .unwrap();

        let contracts = repo.smart_contracts();
        assert_eq!(contracts.len(), 1);
        assert!(contracts[0].code.is_none());
        assert_eq!(contracts[0].action, ContractAction::Updated);
    }
}
