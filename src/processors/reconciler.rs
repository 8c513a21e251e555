//! NFT ownership reconciler
//!
//! Derived ownership can drift from chain truth (custodial moves,
//! missed events, contract-side burns). Each cycle verifies the
//! largest (collection, owner) pairs against live chain state via
//! script execution and deletes rows the chain no longer backs.
//! Queue-based and best effort, like the metadata worker.

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cadence::extract_lossy;
use crate::config;
use crate::error::BoxError;
use crate::processor::{Processor, ProcessorContext, NFT_RECONCILER_WORKER};
use crate::scripts;

pub struct NftReconcilerProcessor {
    ctx: ProcessorContext,
}

impl NftReconcilerProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }
}

/// On-chain id set from the script result ([UInt64] in JSON-CDC).
fn ids_from_result(result: &serde_json::Value) -> HashSet<String> {
    match extract_lossy(result) {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        _ => HashSet::new(),
    }
}

fn split_contract_id(contract_id: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = contract_id.split('.').collect();
    if parts.len() == 3 && parts[0] == "A" {
        Some((parts[1].to_string(), parts[2].to_string()))
    } else {
        None
    }
}

#[async_trait]
impl Processor for NftReconcilerProcessor {
    fn name(&self) -> &'static str {
        NFT_RECONCILER_WORKER
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
        let timeout = Duration::from_millis(config::nft_reconciler_script_timeout_ms());
        let script = scripts::nft_collection_ids_script();
        let verify_batch = config::nft_reconciler_verify_batch();

        let pairs = repo
            .list_top_owner_collections(config::nft_reconciler_pairs_per_cycle())
            .await?;

        for (contract_id, owner) in pairs {
            if cancel.is_cancelled() {
                break;
            }
            let Some((contract_address, contract_name)) = split_contract_id(&contract_id) else {
                continue;
            };
            let arguments = vec![
                scripts::address_argument(&owner),
                scripts::address_argument(&contract_address),
                scripts::string_argument(&contract_name),
            ];
            let on_chain = match tokio::time::timeout(
                timeout,
                client.execute_script_at_latest_block(&script, arguments, cancel),
            )
            .await
            {
                Ok(Ok(value)) => ids_from_result(&value),
                Ok(Err(e)) => {
                    warn!(contract = %contract_id, owner = %owner, error = %e,
                        "reconcile script failed");
                    continue;
                }
                Err(_) => {
                    warn!(contract = %contract_id, owner = %owner, "reconcile script timed out");
                    continue;
                }
            };

            let claims = repo
                .list_nft_ownership(&contract_id, &owner, verify_batch)
                .await?;
            for claim in claims {
                if !on_chain.contains(&claim.nft_id) {
                    debug!(
                        contract = %contract_id,
                        owner = %owner,
                        nft_id = %claim.nft_id,
                        "ownership row not backed by chain; removing"
                    );
                    repo.delete_nft_ownership(&contract_id, &claim.nft_id).await?;
                }
            }
        }
        Ok(())
    }
}
