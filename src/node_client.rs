//! Access node client abstraction
//!
//! One `NodeClient` fronts one remote access node. The pool pins a
//! client per height; the fetcher drives it through the fallback
//! ladder. Implementations map their transport's failures onto the
//! `NodeError` taxonomy so the ladder can route them.
//!
//! Typed result calls transcode event payloads to JSON-CDC bytes and
//! may fail with decode errors; the `*_raw` variants hand back the wire
//! bytes untouched, bypassing the decoder entirely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::error::NodeError;

/// Block header plus the light metadata needed for ingestion.
#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub height: u64,
    pub id: String,
    pub parent_id: String,
    pub timestamp: DateTime<Utc>,
    pub collection_guarantees: Vec<CollectionGuarantee>,
    pub seals: Vec<BlockSeal>,
    pub signatures: Vec<String>,
    pub sealed: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CollectionGuarantee {
    pub collection_id: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BlockSeal {
    pub block_id: String,
    pub execution_result_id: String,
}

/// A collection: an ordered list of transaction ids.
#[derive(Debug, Clone)]
pub struct Collection {
    pub id: String,
    pub transaction_ids: Vec<String>,
}

/// A transaction as served by the node, before normalization.
#[derive(Debug, Clone, Default)]
pub struct WireTransaction {
    pub id: String,
    pub script: String,
    /// JSON-CDC argument blobs, one per argument.
    pub arguments: Vec<String>,
    pub proposer: String,
    pub payer: String,
    pub authorizers: Vec<String>,
    pub gas_limit: u64,
    pub proposal_key: Option<String>,
    pub payload_signatures: Option<String>,
    pub envelope_signatures: Option<String>,
}

/// A transaction result as served by the node.
#[derive(Debug, Clone, Default)]
pub struct WireTransactionResult {
    /// Missing on index-keyed responses from some nodes.
    pub transaction_id: Option<String>,
    pub status: String,
    pub error_message: String,
    pub computation_used: u64,
    pub events: Vec<WireEvent>,
}

/// One emitted event; `payload` is JSON-CDC bytes.
#[derive(Debug, Clone)]
pub struct WireEvent {
    pub event_type: String,
    pub transaction_id: String,
    pub transaction_index: u32,
    pub event_index: u32,
    pub payload: Vec<u8>,
}

/// Account state at a height.
#[derive(Debug, Clone, Default)]
pub struct Account {
    pub address: String,
    pub balance: u64,
    /// Contract name → source text.
    pub contracts: HashMap<String, String>,
}

/// One remote access node. Every method observes the cancellation
/// token at its suspension points.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Endpoint string, used for logging and node flags.
    fn endpoint(&self) -> &str;

    async fn get_latest_block_height(&self, cancel: &CancellationToken) -> Result<u64, NodeError>;

    async fn get_block_header_by_height(
        &self,
        height: u64,
        cancel: &CancellationToken,
    ) -> Result<BlockHeader, NodeError>;

    async fn get_collection(
        &self,
        collection_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Collection, NodeError>;

    async fn get_transaction(
        &self,
        transaction_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WireTransaction, NodeError>;

    /// Bulk transaction list; not implemented by every node.
    async fn get_transactions_by_block_id(
        &self,
        block_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<WireTransaction>, NodeError>;

    async fn get_transaction_result(
        &self,
        transaction_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WireTransactionResult, NodeError>;

    async fn get_transaction_result_by_index(
        &self,
        block_id: &str,
        index: u32,
        cancel: &CancellationToken,
    ) -> Result<WireTransactionResult, NodeError>;

    /// Typed bulk results; runs the decoder node-side and may fail with
    /// decode errors on historical payloads.
    async fn get_transaction_results_by_block_id(
        &self,
        block_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<WireTransactionResult>, NodeError>;

    /// Raw-wire bulk results (JSON-CDC passthrough, no decoder).
    async fn get_transaction_results_by_block_id_raw(
        &self,
        block_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<WireTransactionResult>, NodeError>;

    /// Raw-wire single result.
    async fn get_transaction_result_raw(
        &self,
        transaction_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WireTransactionResult, NodeError>;

    async fn get_account_at_block_height(
        &self,
        address: &str,
        height: u64,
        cancel: &CancellationToken,
    ) -> Result<Account, NodeError>;

    async fn execute_script_at_latest_block(
        &self,
        code: &str,
        arguments: Vec<serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, NodeError>;
}

/// Race a node operation against the cancellation token.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, NodeError>
where
    F: Future<Output = Result<T, NodeError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(NodeError::Cancelled),
        res = fut => res,
    }
}
