//! Block fetcher
//!
//! Turns a height into a reconciled `FetchResult` using one pinned
//! node. Per height the flow is pin → header → transactions → results
//! → reconcile → normalize, with a repin back-edge on node-level
//! failures and a fallback ladder inside the transaction/result steps:
//!
//! - bulk transaction list → per-collection, per-transaction fetch
//! - typed bulk results → per-transaction results (index- or id-keyed)
//! - below the modern-Cadence floor: raw-wire bulk → raw per-transaction
//!
//! Anything recoverable becomes a `FetchWarning` instead of failing the
//! block; only exhausted pin attempts or truly unknown errors surface.

use futures::FutureExt;
use sha2::{Digest, Sha256};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cadence;
use crate::config;
use crate::error::NodeError;
use crate::metrics;
use crate::node_client::{BlockHeader, WireTransaction, WireTransactionResult};
use crate::pool::{PinnedClient, PinnedPool};
use crate::types::{Block, BlockPayloads, Event, FetchResult, FetchWarning, Transaction,
    TransactionStatus};

/// Pin attempts before a height is declared unfetchable.
const MAX_PIN_ATTEMPTS: u32 = 30;

/// Remote phrasings for "the result exists but this node cannot serve
/// it"; any of these synthesizes a sealed-empty result.
const RESULT_UNAVAILABLE_MARKERS: &[&str] = &[
    "transaction result unavailable",
    "failed to retrieve result",
    "result cannot be found",
    "no known transaction",
];

pub struct BlockFetcher {
    pool: Arc<PinnedPool>,
}

impl BlockFetcher {
    pub fn new(pool: Arc<PinnedPool>) -> Self {
        Self { pool }
    }

    /// Fetch and reconcile everything for one height.
    pub async fn fetch_block_data(
        &self,
        height: u64,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, NodeError> {
        let timer = metrics::FETCH_DURATION.start_timer();
        let mut last_err = NodeError::NoSuitableNode { height };

        for attempt in 0..MAX_PIN_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(NodeError::Cancelled);
            }
            let pin = self.pool.pin_by_height(height, attempt)?;

            match self.fetch_once(&pin, height, cancel).await {
                Ok(result) => {
                    timer.observe_duration();
                    return Ok(result);
                }
                Err(NodeError::Cancelled) => return Err(NodeError::Cancelled),
                Err(err) => {
                    if err.indicates_spork_boundary() {
                        // The node told us its floor; remember it so the
                        // next pin skips this node for this height.
                        let floor = err.spork_root_height().unwrap_or(height + 1);
                        self.pool.mark_node_min_height(pin.node_index(), floor);
                        metrics::FETCH_REPINS.with_label_values(&["spork_root"]).inc();
                        debug!(height, node = pin.node(), floor, "spork boundary, repinning");
                    } else if err.is_resource_exhausted() {
                        metrics::FETCH_REPINS.with_label_values(&["exhausted"]).inc();
                        let backoff = Duration::from_millis(250 * (attempt as u64 + 1).min(20));
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    } else if matches!(err, NodeError::NodeUnavailable { .. }) {
                        metrics::FETCH_REPINS.with_label_values(&["unavailable"]).inc();
                        warn!(height, node = pin.node(), error = %err, "node unavailable, repinning");
                    } else {
                        // Not a node-level failure; no point rotating.
                        return Err(err);
                    }
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }

    async fn fetch_once(
        &self,
        pin: &PinnedClient,
        height: u64,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, NodeError> {
        let mut warnings: Vec<FetchWarning> = Vec::new();

        let header = pin
            .client()
            .get_block_header_by_height(height, cancel)
            .await?;

        let (wire_txs, bulk_list_ok) = self
            .fetch_transactions(pin, &header, &mut warnings, cancel)
            .await?;

        let results = self
            .fetch_results(pin, &header, &wire_txs, bulk_list_ok, &mut warnings, cancel)
            .await?;

        Ok(assemble(&header, wire_txs, results, warnings))
    }

    /// Step 3: transaction list, bulk first, per-collection fallback.
    async fn fetch_transactions(
        &self,
        pin: &PinnedClient,
        header: &BlockHeader,
        warnings: &mut Vec<FetchWarning>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<WireTransaction>, bool), NodeError> {
        if !pin.no_bulk_api() {
            match pin
                .client()
                .get_transactions_by_block_id(&header.id, cancel)
                .await
            {
                Ok(txs) => return Ok((txs, true)),
                Err(e) if e.is_unimplemented() => {
                    self.pool.mark_no_bulk_api(pin.node_index());
                    metrics::FETCH_FALLBACKS
                        .with_label_values(&["per_collection"])
                        .inc();
                }
                Err(e) => return Err(e),
            }
        } else {
            metrics::FETCH_FALLBACKS
                .with_label_values(&["per_collection"])
                .inc();
        }

        // Per-collection enumeration: collect tx ids in order, then
        // fetch bodies concurrently under the fan-out bound.
        let mut tx_ids: Vec<String> = Vec::new();
        for guarantee in &header.collection_guarantees {
            match pin
                .client()
                .get_collection(&guarantee.collection_id, cancel)
                .await
            {
                Ok(collection) => tx_ids.extend(collection.transaction_ids),
                Err(e) if e.is_not_found() => {
                    warnings.push(FetchWarning::new(format!(
                        "collection {} not found on {}; skipped",
                        guarantee.collection_id,
                        pin.node()
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        let semaphore = Arc::new(Semaphore::new(config::tx_fetch_concurrency()));
        let fetches: Vec<_> = tx_ids
            .iter()
            .map(|tx_id| {
                let sem = Arc::clone(&semaphore);
                let client = Arc::clone(pin.client());
                let tx_id = tx_id.clone();
                async move {
                    let _permit = sem.acquire().await;
                    client.get_transaction(&tx_id, cancel).await
                }
            })
            .collect();

        let mut txs = Vec::with_capacity(tx_ids.len());
        for (tx_id, fetched) in tx_ids.iter().zip(futures::future::join_all(fetches).await) {
            match fetched {
                Ok(tx) => txs.push(tx),
                Err(e) if e.is_not_found() => {
                    warnings.push(FetchWarning::for_tx(
                        tx_id.clone(),
                        format!("transaction missing from {}; skipped", pin.node()),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        Ok((txs, false))
    }

    /// Step 4: transaction results through the three-tier ladder.
    async fn fetch_results(
        &self,
        pin: &PinnedClient,
        header: &BlockHeader,
        txs: &[WireTransaction],
        bulk_list_ok: bool,
        warnings: &mut Vec<FetchWarning>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<WireTransactionResult>>, NodeError> {
        let modern = header.height >= config::modern_cadence_floor();

        let bulk = if modern {
            // Typed bulk results inside a panic-safe region: the
            // decoder is known to crash on some historical payloads.
            let fut = pin
                .client()
                .get_transaction_results_by_block_id(&header.id, cancel);
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(results)) => Some(results),
                Ok(Err(e)) if is_bulk_results_fallback(&e) => {
                    if e.is_unimplemented() {
                        self.pool.mark_no_bulk_api(pin.node_index());
                    }
                    debug!(height = header.height, error = %e, "typed bulk results failed, per-tx fallback");
                    metrics::FETCH_FALLBACKS.with_label_values(&["per_tx"]).inc();
                    None
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(height = header.height, "decoder panic in bulk results, per-tx fallback");
                    metrics::FETCH_FALLBACKS.with_label_values(&["per_tx"]).inc();
                    None
                }
            }
        } else {
            // Pre-1.0 Cadence: skip the typed path entirely.
            metrics::FETCH_FALLBACKS.with_label_values(&["raw_bulk"]).inc();
            match pin
                .client()
                .get_transaction_results_by_block_id_raw(&header.id, cancel)
                .await
            {
                Ok(results) => Some(results),
                Err(e) => {
                    debug!(height = header.height, error = %e, "raw bulk results failed, raw per-tx fallback");
                    metrics::FETCH_FALLBACKS
                        .with_label_values(&["raw_per_tx"])
                        .inc();
                    None
                }
            }
        };

        let mut aligned = match bulk {
            Some(results) => reconcile_results(txs, results),
            None => {
                self.fetch_results_per_tx(pin, header, txs, bulk_list_ok, modern, cancel)
                    .await?
            }
        };

        // Step 5: individual index-based fetch for anything still
        // missing; unavailable results become sealed-empty synthetics.
        for (index, slot) in aligned.iter_mut().enumerate() {
            if slot.is_some() {
                continue;
            }
            let tx_id = &txs[index].id;
            match pin
                .client()
                .get_transaction_result_by_index(&header.id, index as u32, cancel)
                .await
            {
                Ok(result) => *slot = Some(result),
                Err(e) if e.is_not_found() || is_result_unavailable(&e) => {
                    metrics::FETCH_FALLBACKS
                        .with_label_values(&["synthesized"])
                        .inc();
                    warnings.push(FetchWarning {
                        tx_id: Some(tx_id.clone()),
                        tx_index: Some(index as u32),
                        message: format!("result unavailable, synthesized sealed-empty: {}", e),
                    });
                    *slot = Some(sealed_empty_result(tx_id));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(aligned)
    }

    /// Per-transaction result fetch, bounded. Index-keyed when the bulk
    /// transaction list succeeded (ids may be elided there), id-keyed
    /// otherwise. Raw variants bypass the decoder below the floor.
    async fn fetch_results_per_tx(
        &self,
        pin: &PinnedClient,
        header: &BlockHeader,
        txs: &[WireTransaction],
        bulk_list_ok: bool,
        modern: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<WireTransactionResult>>, NodeError> {
        let semaphore = Arc::new(Semaphore::new(config::tx_fetch_concurrency()));
        let fetches: Vec<_> = txs
            .iter()
            .enumerate()
            .map(|(index, tx)| {
                let sem = Arc::clone(&semaphore);
                let client = Arc::clone(pin.client());
                let block_id = header.id.clone();
                let tx_id = tx.id.clone();
                async move {
                    let _permit = sem.acquire().await;
                    if !modern {
                        client.get_transaction_result_raw(&tx_id, cancel).await
                    } else if bulk_list_ok {
                        client
                            .get_transaction_result_by_index(&block_id, index as u32, cancel)
                            .await
                    } else {
                        client.get_transaction_result(&tx_id, cancel).await
                    }
                }
            })
            .collect();

        let mut out = Vec::with_capacity(txs.len());
        for fetched in futures::future::join_all(fetches).await {
            match fetched {
                Ok(result) => out.push(Some(result)),
                // Leave the slot empty; the caller's reconcile pass
                // retries by index and synthesizes if still absent.
                Err(e) if e.is_not_found() || is_result_unavailable(&e) => out.push(None),
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// Bulk typed-results failures that route to the per-tx fallback
/// instead of a repin.
fn is_bulk_results_fallback(err: &NodeError) -> bool {
    if err.is_unimplemented() {
        return true;
    }
    if matches!(err, NodeError::Decode { .. }) {
        return true;
    }
    let msg = err.to_string();
    err.status_code() == Some(crate::error::RpcStatusCode::Internal)
        || msg.contains("transaction failed but error message is empty")
        || msg.contains("message larger than max")
}

fn is_result_unavailable(err: &NodeError) -> bool {
    let msg = err.to_string();
    RESULT_UNAVAILABLE_MARKERS.iter().any(|m| msg.contains(m))
}

/// Align results with transactions: by index when the counts line up
/// and ids don't contradict, by id otherwise.
fn reconcile_results(
    txs: &[WireTransaction],
    results: Vec<WireTransactionResult>,
) -> Vec<Option<WireTransactionResult>> {
    let index_aligned = results.len() == txs.len()
        && results
            .iter()
            .zip(txs)
            .all(|(r, t)| r.transaction_id.as_deref().map_or(true, |id| id == t.id));
    if index_aligned {
        return results.into_iter().map(Some).collect();
    }

    let mut by_id: std::collections::HashMap<String, WireTransactionResult> = results
        .into_iter()
        .filter_map(|r| r.transaction_id.clone().map(|id| (id, r)))
        .collect();
    txs.iter().map(|t| by_id.remove(&t.id)).collect()
}

fn sealed_empty_result(tx_id: &str) -> WireTransactionResult {
    WireTransactionResult {
        transaction_id: Some(tx_id.to_string()),
        status: "SEALED".to_string(),
        error_message: String::new(),
        computation_used: 0,
        events: Vec::new(),
    }
}

fn parse_status(raw: &str) -> TransactionStatus {
    match raw.to_uppercase().as_str() {
        "SEALED" => TransactionStatus::Sealed,
        "EXECUTED" => TransactionStatus::Executed,
        "EXPIRED" => TransactionStatus::Expired,
        "PENDING" => TransactionStatus::Pending,
        _ => TransactionStatus::Unknown,
    }
}

pub fn script_hash(script: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    hex::encode(hasher.finalize())
}

/// Steps 6-8: normalize transactions, flatten events, accumulate block
/// totals.
fn assemble(
    header: &BlockHeader,
    wire_txs: Vec<WireTransaction>,
    results: Vec<Option<WireTransactionResult>>,
    warnings: Vec<FetchWarning>,
) -> FetchResult {
    let mut transactions = Vec::with_capacity(wire_txs.len());
    let mut events = Vec::new();
    let mut total_gas_used: u64 = 0;

    for (index, (wire, result)) in wire_txs.into_iter().zip(results).enumerate() {
        let result = result.unwrap_or_else(|| sealed_empty_result(&wire.id));
        total_gas_used += result.computation_used;

        let mut is_evm = false;
        for wire_event in &result.events {
            let (decoded_type, payload) = cadence::decode_event_payload_safe(&wire_event.payload);
            let event_type = if wire_event.event_type.is_empty() {
                decoded_type.unwrap_or_default()
            } else {
                wire_event.event_type.clone()
            };
            if event_type.contains("EVM.TransactionExecuted") {
                is_evm = true;
            }
            events.push(Event {
                transaction_id: wire.id.clone(),
                transaction_index: index as u32,
                event_index: wire_event.event_index,
                event_type,
                block_height: header.height,
                timestamp: header.timestamp,
                payload,
            });
        }

        transactions.push(Transaction {
            id: wire.id,
            block_height: header.height,
            block_id: header.id.clone(),
            transaction_index: index as u32,
            proposer: crate::address::normalize_flow_address(&wire.proposer),
            payer: crate::address::normalize_flow_address(&wire.payer),
            authorizers: wire
                .authorizers
                .iter()
                .map(|a| crate::address::normalize_flow_address(a))
                .collect(),
            script_hash: script_hash(&wire.script),
            script: wire.script,
            arguments: wire.arguments,
            gas_limit: wire.gas_limit,
            gas_used: result.computation_used,
            status: parse_status(&result.status),
            error_message: if result.error_message.is_empty() {
                None
            } else {
                Some(result.error_message)
            },
            proposal_key: wire.proposal_key,
            payload_signatures: wire.payload_signatures,
            envelope_signatures: wire.envelope_signatures,
            is_evm,
        });
    }

    let payloads = if config::store_block_payloads() {
        Some(BlockPayloads {
            collection_guarantees: serde_json::to_string(&header.collection_guarantees).ok(),
            seals: serde_json::to_string(&header.seals).ok(),
            signatures: serde_json::to_string(&header.signatures).ok(),
        })
    } else {
        None
    };

    let block = Block {
        height: header.height,
        id: header.id.clone(),
        parent_id: header.parent_id.clone(),
        timestamp: header.timestamp,
        collection_count: header.collection_guarantees.len() as u32,
        tx_count: transactions.len() as u32,
        event_count: events.len() as u32,
        total_gas_used,
        execution_result_id: header.seals.first().map(|s| s.execution_result_id.clone()),
        payloads,
        sealed: header.sealed,
    };

    if !warnings.is_empty() {
        info!(
            height = header.height,
            warnings = warnings.len(),
            "block fetched with warnings"
        );
    }

    FetchResult {
        block,
        transactions,
        events,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_client::{CollectionGuarantee, NodeClient, WireEvent};
    use crate::testutil::{block_id_for, test_timestamp, tx_id_for, FailureMode, StubNodeClient};

    // Heights relative to the modern-Cadence floor default.
    const MODERN: u64 = 90_000_000;
    const LEGACY: u64 = 1_000;

    fn header(height: u64, collections: Vec<&str>) -> BlockHeader {
        BlockHeader {
            height,
            id: block_id_for(height),
            parent_id: block_id_for(height.saturating_sub(1)),
            timestamp: test_timestamp(),
            collection_guarantees: collections
                .into_iter()
                .map(|c| CollectionGuarantee {
                    collection_id: c.to_string(),
                })
                .collect(),
            seals: vec![],
            signatures: vec![],
            sealed: true,
        }
    }

    fn wire_tx(n: u64) -> WireTransaction {
        WireTransaction {
            id: tx_id_for(n),
            script: format!("transaction {{ // {} }}", n),
            proposer: "0x1e3c78c6d580273b".to_string(),
            payer: "0x1e3c78c6d580273b".to_string(),
            authorizers: vec!["0x1e3c78c6d580273b".to_string()],
            gas_limit: 9999,
            ..Default::default()
        }
    }

    fn wire_result(n: u64, events: Vec<WireEvent>) -> WireTransactionResult {
        WireTransactionResult {
            transaction_id: Some(tx_id_for(n)),
            status: "SEALED".to_string(),
            error_message: String::new(),
            computation_used: 7,
            events,
        }
    }

    fn deposit_event(n: u64, event_index: u32) -> WireEvent {
        let payload = serde_json::json!({
            "type": "Event",
            "value": {
                "id": "A.1654653399040a61.FlowToken.TokensDeposited",
                "fields": [
                    {"name": "amount", "value": {"type": "UFix64", "value": "5.00000000"}}
                ]
            }
        });
        WireEvent {
            event_type: "A.1654653399040a61.FlowToken.TokensDeposited".to_string(),
            transaction_id: tx_id_for(n),
            transaction_index: 0,
            event_index,
            payload: serde_json::to_vec(&payload).unwrap(),
        }
    }

    fn bulk_node(height: u64) -> StubNodeClient {
        let node = StubNodeClient::named("an-bulk");
        node.add_header(header(height, vec!["c1"]));
        node.set_tx_list(&block_id_for(height), vec![wire_tx(1), wire_tx(2)]);
        node.set_results_for_block(
            &block_id_for(height),
            vec![
                wire_result(1, vec![deposit_event(1, 0)]),
                wire_result(2, vec![]),
            ],
        );
        node
    }

    fn fetcher_for(nodes: Vec<StubNodeClient>) -> (BlockFetcher, Arc<PinnedPool>) {
        crate::config::init_empty_for_tests();
        let clients: Vec<Arc<dyn NodeClient>> = nodes
            .into_iter()
            .map(|n| Arc::new(n) as Arc<dyn NodeClient>)
            .collect();
        let pool = Arc::new(PinnedPool::new(clients));
        (BlockFetcher::new(Arc::clone(&pool)), pool)
    }

    #[tokio::test]
    async fn test_happy_path_bulk() {
        let (fetcher, _) = fetcher_for(vec![bulk_node(MODERN)]);
        let result = fetcher
            .fetch_block_data(MODERN, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.block.tx_count, 2);
        assert_eq!(result.block.event_count, 1);
        assert_eq!(result.block.total_gas_used, 14);
        assert_eq!(result.transactions[0].proposer, "1e3c78c6d580273b");
        assert_eq!(result.transactions[0].gas_used, 7);
        assert_eq!(result.events[0].payload["amount"], "5.00000000");
        assert!(result.warnings.is_empty());
        // Script hashes are the SHA-256 of the script text.
        assert_eq!(
            result.transactions[0].script_hash,
            script_hash(&result.transactions[0].script)
        );
    }

    #[tokio::test]
    async fn test_unimplemented_bulk_flags_node_and_uses_collections() {
        // S6: same data served both ways must come out identical.
        let plain = bulk_node(MODERN);
        let baseline = {
            let (fetcher, _) = fetcher_for(vec![plain]);
            fetcher
                .fetch_block_data(MODERN, &CancellationToken::new())
                .await
                .unwrap()
        };

        let no_bulk = bulk_node(MODERN);
        no_bulk.set_bulk_tx_mode(FailureMode::Unimplemented);
        no_bulk.add_collection(crate::node_client::Collection {
            id: "c1".to_string(),
            transaction_ids: vec![tx_id_for(1), tx_id_for(2)],
        });
        no_bulk.add_transaction(wire_tx(1));
        no_bulk.add_transaction(wire_tx(2));

        let (fetcher, pool) = fetcher_for(vec![no_bulk]);
        let result = fetcher
            .fetch_block_data(MODERN, &CancellationToken::new())
            .await
            .unwrap();

        assert!(pool.pin_by_height(MODERN, 0).unwrap().no_bulk_api());
        let ids: Vec<&str> = result.transactions.iter().map(|t| t.id.as_str()).collect();
        let expected: Vec<&str> = baseline.transactions.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, expected);
        assert_eq!(result.block.event_count, baseline.block.event_count);
    }

    #[tokio::test]
    async fn test_bulk_results_decode_error_falls_back_per_tx() {
        let node = bulk_node(MODERN);
        node.set_bulk_results_mode(FailureMode::DecodeError);
        let (fetcher, _) = fetcher_for(vec![node]);
        let result = fetcher
            .fetch_block_data(MODERN, &CancellationToken::new())
            .await
            .unwrap();
        // Per-tx fallback (index-keyed) still produces both results.
        assert_eq!(result.transactions.len(), 2);
        assert_eq!(result.block.total_gas_used, 14);
    }

    #[tokio::test]
    async fn test_missing_result_synthesizes_sealed_empty() {
        let node = StubNodeClient::named("an-0");
        node.add_header(header(MODERN, vec![]));
        node.set_tx_list(&block_id_for(MODERN), vec![wire_tx(1)]);
        node.set_single_result_mode(FailureMode::NotFound);
        // Bulk results returns an empty list, so tx 1 has no result.
        node.set_results_for_block(&block_id_for(MODERN), vec![]);

        let (fetcher, _) = fetcher_for(vec![node]);
        let result = fetcher
            .fetch_block_data(MODERN, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.transactions.len(), 1);
        assert_eq!(result.transactions[0].status, TransactionStatus::Sealed);
        assert_eq!(result.transactions[0].gas_used, 0);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].message.contains("synthesized"));
    }

    #[tokio::test]
    async fn test_spork_root_raises_floor_and_repins() {
        let stale = StubNodeClient::named("an-stale");
        stale.set_header_mode(FailureMode::SporkRoot(MODERN + 100));
        let good = bulk_node(MODERN);

        let (fetcher, pool) = fetcher_for(vec![stale, good]);
        let result = fetcher
            .fetch_block_data(MODERN, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.block.height, MODERN);
        assert_eq!(pool.node_min_height(0), Some(MODERN + 100));
    }

    #[tokio::test]
    async fn test_legacy_height_uses_raw_path() {
        let node = StubNodeClient::named("an-0");
        node.add_header(header(LEGACY, vec![]));
        node.set_tx_list(&block_id_for(LEGACY), vec![wire_tx(1)]);
        node.set_results_for_block(&block_id_for(LEGACY), vec![wire_result(1, vec![])]);

        let (fetcher, _) = fetcher_for(vec![node]);
        let result = fetcher
            .fetch_block_data(LEGACY, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_evm_flag_from_event_type() {
        let node = StubNodeClient::named("an-0");
        node.add_header(header(MODERN, vec![]));
        node.set_tx_list(&block_id_for(MODERN), vec![wire_tx(1)]);
        let evm_event = WireEvent {
            event_type: "A.e467b9dd11fa00df.EVM.TransactionExecuted".to_string(),
            transaction_id: tx_id_for(1),
            transaction_index: 0,
            event_index: 0,
            payload: b"{}".to_vec(),
        };
        node.set_results_for_block(&block_id_for(MODERN), vec![wire_result(1, vec![evm_event])]);

        let (fetcher, _) = fetcher_for(vec![node]);
        let result = fetcher
            .fetch_block_data(MODERN, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.transactions[0].is_evm);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail() {
        let node = StubNodeClient::named("an-dead");
        node.set_header_mode(FailureMode::Unavailable);
        let (fetcher, _) = fetcher_for(vec![node]);
        let err = fetcher
            .fetch_block_data(MODERN, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::NodeUnavailable { .. }));
    }

    #[test]
    fn test_reconcile_falls_back_to_id_matching() {
        let txs = vec![wire_tx(1), wire_tx(2)];
        // Results arrive in reverse order with ids set, count mismatch
        // avoided but order wrong.
        let results = vec![wire_result(2, vec![]), wire_result(1, vec![])];
        let aligned = reconcile_results(&txs, results);
        assert_eq!(
            aligned[0].as_ref().unwrap().transaction_id.as_deref(),
            Some(tx_id_for(1).as_str())
        );
        assert_eq!(
            aligned[1].as_ref().unwrap().transaction_id.as_deref(),
            Some(tx_id_for(2).as_str())
        );
    }
}
