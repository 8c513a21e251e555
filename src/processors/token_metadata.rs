//! Token metadata enricher
//!
//! Queue-based: the height range is ignored; each run drains a slice of
//! the repository-maintained candidate lists (FT and NFT contracts with
//! no metadata row yet) and resolves their display metadata through
//! Cadence script execution. Strictly best effort: a contract that
//! fails to resolve just stays on the queue.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cadence::extract_lossy;
use crate::config;
use crate::error::BoxError;
use crate::processor::{Processor, ProcessorContext, TOKEN_METADATA_WORKER};
use crate::scripts;
use crate::types::TokenMetadataRow;

pub struct TokenMetadataProcessor {
    ctx: ProcessorContext,
}

impl TokenMetadataProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }
}

/// Split `A.<addr>.<Name>` into (address, name).
fn split_contract_id(contract_id: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = contract_id.split('.').collect();
    if parts.len() == 3 && parts[0] == "A" {
        Some((parts[1].to_string(), parts[2].to_string()))
    } else {
        None
    }
}

/// Build a metadata row from the flattened script result.
fn row_from_result(contract_id: &str, is_nft: bool, result: &Value) -> Option<TokenMetadataRow> {
    let flat = extract_lossy(result);
    let map = flat.as_object()?;
    let get = |key: &str| map.get(key).and_then(|v| v.as_str()).map(|s| s.to_string());
    Some(TokenMetadataRow {
        contract_id: contract_id.to_string(),
        name: get("name"),
        symbol: get("symbol"),
        decimals: map
            .get("decimals")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok()),
        description: get("description"),
        logo_url: get("logoUrl"),
        is_nft,
    })
}

#[async_trait]
impl Processor for TokenMetadataProcessor {
    fn name(&self) -> &'static str {
        TOKEN_METADATA_WORKER
    }

    async fn process_range(
        &self,
        _from: u64,
        _to: u64,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let repo = &self.ctx.repository;
        let Some(client) = self.ctx.pool.any_client() else {
            return Ok(());
        };
        let timeout = Duration::from_millis(config::token_metadata_script_timeout_ms());
        let script = scripts::ft_metadata_script();

        let mut candidates: Vec<(String, bool)> = Vec::new();
        for id in repo
            .list_ft_tokens_missing_metadata(config::token_metadata_ft_backfill_per_range())
            .await?
        {
            candidates.push((id, false));
        }
        for id in repo
            .list_nft_tokens_missing_metadata(config::token_metadata_nft_backfill_per_range())
            .await?
        {
            candidates.push((id, true));
        }
        candidates.truncate(config::token_metadata_new_per_range() as usize);

        let mut rows: Vec<TokenMetadataRow> = Vec::new();
        for (contract_id, is_nft) in candidates {
            if cancel.is_cancelled() {
                break;
            }
            let Some((address, name)) = split_contract_id(&contract_id) else {
                debug!(contract = %contract_id, "unparseable contract id; skipped");
                continue;
            };
            let arguments = vec![
                scripts::address_argument(&address),
                scripts::string_argument(&name),
            ];
            let result = tokio::time::timeout(
                timeout,
                client.execute_script_at_latest_block(&script, arguments, cancel),
            )
            .await;
            match result {
                Ok(Ok(value)) => {
                    if let Some(row) = row_from_result(&contract_id, is_nft, &value) {
                        rows.push(row);
                    }
                }
                Ok(Err(e)) => {
                    warn!(contract = %contract_id, error = %e, "metadata script failed");
                }
                Err(_) => {
                    warn!(contract = %contract_id, "metadata script timed out");
                }
            }
        }

        if !rows.is_empty() {
            repo.upsert_token_metadata(&rows).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_client::NodeClient;
    use crate::pool::PinnedPool;
    use crate::repository::Repository;
    use crate::testutil::*;
    use crate::types::ContractRegistryRow;
    use serde_json::json;
    use std::sync::Arc;

    fn registry_row(contract_id: &str, is_nft: bool) -> ContractRegistryRow {
        ContractRegistryRow {
            contract_id: contract_id.to_string(),
            contract_address: "1654653399040a61".to_string(),
            contract_name: contract_id.rsplit('.').next().unwrap().to_string(),
            is_nft,
            first_seen_height: 1,
        }
    }

    #[tokio::test]
    async fn test_resolves_missing_metadata() {
        crate::config::init_empty_for_tests();
        let repo = Arc::new(MemoryRepository::new());
        repo.seed_registry(vec![registry_row("A.1654653399040a61.FlowToken", false)]);

        let node = StubNodeClient::named("an-0");
        node.set_script_result(json!({
            "type": "Optional",
            "value": {
                "type": "Dictionary",
                "value": [
                    {"key": {"type": "String", "value": "name"},
                     "value": {"type": "String", "value": "Flow"}},
                    {"key": {"type": "String", "value": "symbol"},
                     "value": {"type": "String", "value": "FLOW"}}
                ]
            }
        }));
        let pool = Arc::new(PinnedPool::new(vec![Arc::new(node) as Arc<dyn NodeClient>]));
        let ctx = ProcessorContext::new(Arc::clone(&repo) as Arc<dyn Repository>, pool);

        let processor = TokenMetadataProcessor::new(ctx);
        processor
            .process_range(0, 0, &CancellationToken::new())
            .await
            .unwrap();

        let rows = repo.token_metadata();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name.as_deref(), Some("Flow"));
        assert_eq!(rows[0].symbol.as_deref(), Some("FLOW"));

        // The queue is drained: nothing missing on the next cycle.
        assert!(repo
            .list_ft_tokens_missing_metadata(10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_script_failure_is_best_effort() {
        crate::config::init_empty_for_tests();
        let repo = Arc::new(MemoryRepository::new());
        repo.seed_registry(vec![registry_row("A.1654653399040a61.FlowToken", false)]);

        // No script result configured: execution fails.
        let node = StubNodeClient::named("an-0");
        let pool = Arc::new(PinnedPool::new(vec![Arc::new(node) as Arc<dyn NodeClient>]));
        let ctx = ProcessorContext::new(Arc::clone(&repo) as Arc<dyn Repository>, pool);

        let processor = TokenMetadataProcessor::new(ctx);
        processor
            .process_range(0, 0, &CancellationToken::new())
            .await
            .unwrap();
        assert!(repo.token_metadata().is_empty());
        // Candidate stays queued for a later cycle.
        assert_eq!(
            repo.list_ft_tokens_missing_metadata(10).await.unwrap().len(),
            1
        );
    }
}
