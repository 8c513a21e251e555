//! Script import index and transaction tags
//!
//! Parses `import X from 0xADDR` lines out of transaction scripts into
//! tx→contract rows, and classifies transactions with a tag set drawn
//! from imports, materialized transfer rows, and event-type patterns.
//! Scripts repeat heavily across transactions, so parses are cached by
//! script hash.

use async_trait::async_trait;
use lru::LruCache;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::address::normalize_flow_address;
use crate::error::BoxError;
use crate::processor::{Processor, ProcessorContext, TX_CONTRACTS_WORKER};
use crate::types::{Event, TxContractRow, TxTagRow};

const IMPORT_CACHE_SIZE: usize = 4096;

/// Parse the import lines of a Cadence script into (address, name)
/// pairs. String imports (`import "Foo"`) carry no address and are
/// skipped.
pub fn parse_imports(script: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in script.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("import ") else {
            continue;
        };
        let Some((names, address)) = rest.split_once(" from ") else {
            continue;
        };
        let address = normalize_flow_address(address.trim());
        if address.is_empty() {
            continue;
        }
        for name in names.split(',') {
            let name = name.trim();
            if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                out.push((address.clone(), name.to_string()));
            }
        }
    }
    out
}

/// Event-type driven tags for one event.
fn event_tags(event: &Event) -> Vec<&'static str> {
    let ty = event.event_type.as_str();
    let mut tags = Vec::new();
    if ty.contains("EVM.TransactionExecuted") {
        tags.push("EVM");
    }
    if ty.contains("FlowEVMBridge") {
        tags.push("EVM_BRIDGE");
    }
    if ty.contains("Swap") {
        tags.push("SWAP");
    }
    if ty.contains("Liquidity") {
        tags.push("LIQUIDITY");
    }
    if ty.contains("Staking") || ty.contains("FlowIDTableStaking") {
        tags.push("STAKING");
    }
    if ty.contains("Storefront") || ty.contains("Marketplace") {
        tags.push("MARKETPLACE");
    }
    if ty == "flow.AccountContractAdded" || ty == "flow.AccountContractUpdated" {
        tags.push("CONTRACT_DEPLOY");
    }
    if ty == "flow.AccountCreated" {
        tags.push("ACCOUNT_CREATED");
    }
    if ty == "flow.AccountKeyAdded" || ty == "flow.AccountKeyRemoved" {
        tags.push("KEY_UPDATE");
    }
    if ty.ends_with(".TokensMinted") {
        tags.push("TOKEN_MINT");
    }
    if ty.ends_with(".TokensBurned") {
        tags.push("TOKEN_BURN");
    }
    tags
}

pub struct TxContractsProcessor {
    ctx: ProcessorContext,
    import_cache: Mutex<LruCache<String, Vec<(String, String)>>>,
}

impl TxContractsProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self {
            ctx,
            import_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(IMPORT_CACHE_SIZE).unwrap(),
            )),
        }
    }

    /// Imports per script hash, parsing only hashes not yet cached.
    async fn imports_for(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<(String, String)>>, BoxError> {
        let mut resolved: HashMap<String, Vec<(String, String)>> = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        {
            let mut cache = self.import_cache.lock().unwrap();
            for hash in hashes {
                if resolved.contains_key(hash) {
                    continue;
                }
                match cache.get(hash) {
                    Some(imports) => {
                        resolved.insert(hash.clone(), imports.clone());
                    }
                    None => missing.push(hash.clone()),
                }
            }
        }
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            let scripts = self
                .ctx
                .repository
                .get_script_texts_by_hashes(&missing)
                .await?;
            let mut cache = self.import_cache.lock().unwrap();
            for hash in missing {
                let imports = scripts
                    .get(&hash)
                    .map(|s| parse_imports(s))
                    .unwrap_or_default();
                cache.put(hash.clone(), imports.clone());
                resolved.insert(hash, imports);
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl Processor for TxContractsProcessor {
    fn name(&self) -> &'static str {
        TX_CONTRACTS_WORKER
    }

    async fn process_range(
        &self,
        from: u64,
        to: u64,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let repo = &self.ctx.repository;
        let triples = repo.get_tx_script_hashes_in_range(from, to).await?;
        if triples.is_empty() {
            return Ok(());
        }

        let hashes: Vec<String> = triples.iter().map(|(_, h, _)| h.clone()).collect();
        let imports = self.imports_for(&hashes).await?;

        let mut contract_rows: Vec<TxContractRow> = Vec::new();
        let mut tags: HashMap<String, (u64, BTreeSet<String>)> = HashMap::new();

        for (tx_id, script_hash, height) in &triples {
            let entry = tags
                .entry(tx_id.clone())
                .or_insert_with(|| (*height, BTreeSet::new()));
            for (address, name) in imports.get(script_hash).into_iter().flatten() {
                contract_rows.push(TxContractRow {
                    transaction_id: tx_id.clone(),
                    contract_id: format!("A.{}.{}", address, name),
                    block_height: *height,
                });
                if name == "FlowTransactionScheduler" {
                    entry.1.insert("SCHEDULED_TX".to_string());
                }
            }
        }

        for event in repo.get_raw_events_in_range(from, to).await? {
            if let Some((_, set)) = tags.get_mut(&event.transaction_id) {
                for tag in event_tags(&event) {
                    set.insert(tag.to_string());
                }
            }
        }
        for transfer in repo.get_ft_transfers_in_range(from, to).await? {
            if let Some((_, set)) = tags.get_mut(&transfer.transaction_id) {
                set.insert("FT_TRANSFER".to_string());
            }
        }
        for transfer in repo.get_nft_transfers_in_range(from, to).await? {
            if let Some((_, set)) = tags.get_mut(&transfer.transaction_id) {
                set.insert("NFT_TRANSFER".to_string());
            }
        }

        let tag_rows: Vec<TxTagRow> = tags
            .into_iter()
            .flat_map(|(tx_id, (height, set))| {
                set.into_iter().map(move |tag| TxTagRow {
                    transaction_id: tx_id.clone(),
                    tag,
                    block_height: height,
                })
            })
            .collect();

        if !contract_rows.is_empty() {
            repo.upsert_tx_contracts(&contract_rows).await?;
        }
        if !tag_rows.is_empty() {
            repo.upsert_tx_tags(&tag_rows).await?;
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
    use std::sync::Arc;

    #[test]
    fn test_parse_imports_variants() {
        let script = r#"
            import FungibleToken from 0xf233dcee88fe0abe
            import TopShot, Market from 0x0b2a3299cc857e29
            import "StringImport"

            access(all) fun main() {}
        "#;
        let imports = parse_imports(script);
        assert_eq!(
            imports,
            vec![
                ("f233dcee88fe0abe".to_string(), "FungibleToken".to_string()),
                ("0b2a3299cc857e29".to_string(), "TopShot".to_string()),
                ("0b2a3299cc857e29".to_string(), "Market".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_imports_ignores_garbage() {
        assert!(parse_imports("import from 0x1").is_empty());
        assert!(parse_imports("not a script").is_empty());
        assert!(parse_imports("import Foo from notanaddress").is_empty());
    }

    #[test]
    fn test_event_tag_patterns() {
        let ev = make_event(&tx_id_for(1), 1, 0, "A.b063c16cac85dbd1.SwapPair.Swap");
        assert!(event_tags(&ev).contains(&"SWAP"));
        let ev = make_event(&tx_id_for(1), 1, 0, "flow.AccountKeyRemoved");
        assert_eq!(event_tags(&ev), vec!["KEY_UPDATE"]);
        let ev = make_event(&tx_id_for(1), 1, 0, "A.1654653399040a61.FlowToken.TokensMinted");
        assert_eq!(event_tags(&ev), vec!["TOKEN_MINT"]);
    }

    #[tokio::test]
    async fn test_process_range_emits_contracts_and_tags() {
        crate::config::init_empty_for_tests();
        let repo = Arc::new(MemoryRepository::new());

        let mut tx = make_transaction(&tx_id_for(1), 100);
        tx.script = "import FlowTransactionScheduler from 0x8c5303eaa26202d6\n\
                     transaction {}"
            .to_string();
        tx.script_hash = crate::fetcher::script_hash(&tx.script);
        repo.seed_transactions(vec![tx]);
        repo.seed_events(vec![make_event(
            &tx_id_for(1),
            100,
            0,
            "A.e467b9dd11fa00df.EVM.TransactionExecuted",
        )]);

        let ctx = ProcessorContext::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            Arc::new(PinnedPool::new(vec![])),
        );
        let processor = TxContractsProcessor::new(ctx);
        processor
            .process_range(100, 101, &CancellationToken::new())
            .await
            .unwrap();

        let contracts = repo.tx_contracts();
        assert_eq!(contracts.len(), 1);
        assert_eq!(
            contracts[0].contract_id,
            "A.8c5303eaa26202d6.FlowTransactionScheduler"
        );

        let tags: Vec<String> = repo.tx_tags().into_iter().map(|t| t.tag).collect();
        assert!(tags.contains(&"SCHEDULED_TX".to_string()));
        assert!(tags.contains(&"EVM".to_string()));

        // Second run hits the import cache and stays idempotent.
        processor
            .process_range(100, 101, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(repo.tx_contracts().len(), 1);
    }
}
