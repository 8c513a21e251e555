//! Test doubles and fixtures: builders for raw records plus a
//! scriptable stub node client for driving the fetch layer. The
//! in-memory repository lives in `memstore` and is re-exported here.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, RpcStatusCode};
use crate::node_client::*;
use crate::types::*;

pub use crate::memstore::MemoryRepository;

pub fn test_timestamp() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub fn block_id_for(height: u64) -> String {
    format!("{:064x}", height + 0xb10c)
}

pub fn tx_id_for(n: u64) -> String {
    format!("{:064x}", n + 0x7a)
}

/// Build a minimal sealed block for tests.
pub fn make_block(height: u64) -> Block {
    Block {
        height,
        id: block_id_for(height),
        parent_id: if height == 0 {
            "0".repeat(64)
        } else {
            block_id_for(height - 1)
        },
        timestamp: test_timestamp(),
        collection_count: 0,
        tx_count: 0,
        event_count: 0,
        total_gas_used: 0,
        execution_result_id: None,
        payloads: None,
        sealed: true,
    }
}

pub fn make_transaction(id: &str, height: u64) -> Transaction {
    Transaction {
        id: id.to_string(),
        block_height: height,
        block_id: block_id_for(height),
        transaction_index: 0,
        proposer: "1e3c78c6d580273b".to_string(),
        payer: "1e3c78c6d580273b".to_string(),
        authorizers: vec!["1e3c78c6d580273b".to_string()],
        script: "transaction {}".to_string(),
        script_hash: "00".repeat(32),
        arguments: vec![],
        gas_limit: 9999,
        gas_used: 10,
        status: TransactionStatus::Sealed,
        error_message: None,
        proposal_key: None,
        payload_signatures: None,
        envelope_signatures: None,
        is_evm: false,
    }
}

pub fn make_event(tx_id: &str, height: u64, event_index: u32, event_type: &str) -> Event {
    Event {
        transaction_id: tx_id.to_string(),
        transaction_index: 0,
        event_index,
        event_type: event_type.to_string(),
        block_height: height,
        timestamp: test_timestamp(),
        payload: serde_json::json!({}),
    }
}



/// How a stubbed call family should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    #[default]
    None,
    Unimplemented,
    NotFound,
    Exhausted,
    Unavailable,
    SporkRoot(u64),
    DecodeError,
    Internal,
    EmptyErrorBug,
    MessageTooLarge,
}

impl FailureMode {
    fn to_error(self, node: &str) -> Option<NodeError> {
        match self {
            FailureMode::None => None,
            FailureMode::Unimplemented => Some(NodeError::transport(
                Some(RpcStatusCode::Unimplemented),
                "method not implemented",
            )),
            FailureMode::NotFound => Some(NodeError::transport(
                Some(RpcStatusCode::NotFound),
                "not found",
            )),
            FailureMode::Exhausted => Some(NodeError::NodeExhausted {
                node: node.to_string(),
            }),
            FailureMode::Unavailable => Some(NodeError::NodeUnavailable {
                node_index: 0,
                message: "connection refused".to_string(),
            }),
            FailureMode::SporkRoot(h) => Some(NodeError::SporkRootNotFound {
                node: node.to_string(),
                root_height: Some(h),
            }),
            FailureMode::DecodeError => Some(NodeError::decode("ccf decode failed")),
            FailureMode::Internal => Some(NodeError::transport(
                Some(RpcStatusCode::Internal),
                "execution node internal error",
            )),
            FailureMode::EmptyErrorBug => Some(NodeError::transport(
                Some(RpcStatusCode::Internal),
                "transaction failed but error message is empty",
            )),
            FailureMode::MessageTooLarge => Some(NodeError::transport(
                Some(RpcStatusCode::ResourceExhausted),
                "grpc: received message larger than max",
            )),
        }
    }
}

#[derive(Default)]
struct StubState {
    latest_height: u64,
    headers: HashMap<u64, BlockHeader>,
    collections: HashMap<String, Collection>,
    transactions: HashMap<String, WireTransaction>,
    tx_lists: HashMap<String, Vec<WireTransaction>>,
    results_by_block: HashMap<String, Vec<WireTransactionResult>>,
    results_by_id: HashMap<String, WireTransactionResult>,
    accounts: HashMap<String, Account>,
    script_result: Option<serde_json::Value>,

    header_mode: FailureMode,
    bulk_tx_mode: FailureMode,
    bulk_results_mode: FailureMode,
    single_result_mode: FailureMode,
    collection_mode: FailureMode,
    raw_bulk_mode: FailureMode,
}

/// Scriptable `NodeClient` double. Failure modes apply per call family;
/// every call is recorded for assertions.
pub struct StubNodeClient {
    endpoint: String,
    state: Mutex<StubState>,
    pub calls: Mutex<Vec<String>>,
    call_count: AtomicU64,
}

impl StubNodeClient {
    pub fn named(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Mutex::new(StubState::default()),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicU64::new(0),
        }
    }

    pub fn recorded_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    fn record(&self, call: impl Into<String>) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn set_latest_height(&self, h: u64) {
        self.state.lock().unwrap().latest_height = h;
    }

    pub fn add_header(&self, header: BlockHeader) {
        self.state.lock().unwrap().headers.insert(header.height, header);
    }

    pub fn add_collection(&self, collection: Collection) {
        self.state
            .lock()
            .unwrap()
            .collections
            .insert(collection.id.clone(), collection);
    }

    pub fn add_transaction(&self, tx: WireTransaction) {
        self.state
            .lock()
            .unwrap()
            .transactions
            .insert(tx.id.clone(), tx);
    }

    pub fn set_tx_list(&self, block_id: &str, txs: Vec<WireTransaction>) {
        self.state
            .lock()
            .unwrap()
            .tx_lists
            .insert(block_id.to_string(), txs);
    }

    pub fn set_results_for_block(&self, block_id: &str, results: Vec<WireTransactionResult>) {
        self.state
            .lock()
            .unwrap()
            .results_by_block
            .insert(block_id.to_string(), results);
    }

    pub fn set_result_for_tx(&self, tx_id: &str, result: WireTransactionResult) {
        self.state
            .lock()
            .unwrap()
            .results_by_id
            .insert(tx_id.to_string(), result);
    }

    pub fn add_account(&self, account: Account) {
        self.state
            .lock()
            .unwrap()
            .accounts
            .insert(account.address.clone(), account);
    }

    pub fn set_script_result(&self, value: serde_json::Value) {
        self.state.lock().unwrap().script_result = Some(value);
    }

    pub fn set_header_mode(&self, mode: FailureMode) {
        self.state.lock().unwrap().header_mode = mode;
    }

    pub fn set_bulk_tx_mode(&self, mode: FailureMode) {
        self.state.lock().unwrap().bulk_tx_mode = mode;
    }

    pub fn set_bulk_results_mode(&self, mode: FailureMode) {
        self.state.lock().unwrap().bulk_results_mode = mode;
    }

    pub fn set_single_result_mode(&self, mode: FailureMode) {
        self.state.lock().unwrap().single_result_mode = mode;
    }

    pub fn set_collection_mode(&self, mode: FailureMode) {
        self.state.lock().unwrap().collection_mode = mode;
    }

    pub fn set_raw_bulk_mode(&self, mode: FailureMode) {
        self.state.lock().unwrap().raw_bulk_mode = mode;
    }
}

#[async_trait]
impl NodeClient for StubNodeClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn get_latest_block_height(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<u64, NodeError> {
        self.record("latest_height");
        Ok(self.state.lock().unwrap().latest_height)
    }

    async fn get_block_header_by_height(
        &self,
        height: u64,
        _cancel: &CancellationToken,
    ) -> Result<BlockHeader, NodeError> {
        self.record(format!("header:{}", height));
        let state = self.state.lock().unwrap();
        if let Some(err) = state.header_mode.to_error(&self.endpoint) {
            return Err(err);
        }
        state
            .headers
            .get(&height)
            .cloned()
            .ok_or_else(|| NodeError::transport(Some(RpcStatusCode::NotFound), "block not found"))
    }

    async fn get_collection(
        &self,
        collection_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Collection, NodeError> {
        self.record(format!("collection:{}", collection_id));
        let state = self.state.lock().unwrap();
        if let Some(err) = state.collection_mode.to_error(&self.endpoint) {
            return Err(err);
        }
        state.collections.get(collection_id).cloned().ok_or_else(|| {
            NodeError::transport(Some(RpcStatusCode::NotFound), "collection not found")
        })
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<WireTransaction, NodeError> {
        self.record(format!("tx:{}", transaction_id));
        let state = self.state.lock().unwrap();
        state.transactions.get(transaction_id).cloned().ok_or_else(|| {
            NodeError::transport(Some(RpcStatusCode::NotFound), "transaction not found")
        })
    }

    async fn get_transactions_by_block_id(
        &self,
        block_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<WireTransaction>, NodeError> {
        self.record(format!("bulk_tx:{}", block_id));
        let state = self.state.lock().unwrap();
        if let Some(err) = state.bulk_tx_mode.to_error(&self.endpoint) {
            return Err(err);
        }
        Ok(state.tx_lists.get(block_id).cloned().unwrap_or_default())
    }

    async fn get_transaction_result(
        &self,
        transaction_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<WireTransactionResult, NodeError> {
        self.record(format!("result:{}", transaction_id));
        let state = self.state.lock().unwrap();
        if let Some(err) = state.single_result_mode.to_error(&self.endpoint) {
            return Err(err);
        }
        state
            .results_by_id
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| NodeError::transport(Some(RpcStatusCode::NotFound), "result not found"))
    }

    async fn get_transaction_result_by_index(
        &self,
        block_id: &str,
        index: u32,
        _cancel: &CancellationToken,
    ) -> Result<WireTransactionResult, NodeError> {
        self.record(format!("result_by_index:{}:{}", block_id, index));
        let state = self.state.lock().unwrap();
        if let Some(err) = state.single_result_mode.to_error(&self.endpoint) {
            return Err(err);
        }
        state
            .results_by_block
            .get(block_id)
            .and_then(|r| r.get(index as usize))
            .cloned()
            .ok_or_else(|| NodeError::transport(Some(RpcStatusCode::NotFound), "result not found"))
    }

    async fn get_transaction_results_by_block_id(
        &self,
        block_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<WireTransactionResult>, NodeError> {
        self.record(format!("bulk_results:{}", block_id));
        let state = self.state.lock().unwrap();
        if let Some(err) = state.bulk_results_mode.to_error(&self.endpoint) {
            return Err(err);
        }
        Ok(state.results_by_block.get(block_id).cloned().unwrap_or_default())
    }

    async fn get_transaction_results_by_block_id_raw(
        &self,
        block_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<WireTransactionResult>, NodeError> {
        self.record(format!("raw_bulk_results:{}", block_id));
        let state = self.state.lock().unwrap();
        if let Some(err) = state.raw_bulk_mode.to_error(&self.endpoint) {
            return Err(err);
        }
        Ok(state.results_by_block.get(block_id).cloned().unwrap_or_default())
    }

    async fn get_transaction_result_raw(
        &self,
        transaction_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<WireTransactionResult, NodeError> {
        self.record(format!("raw_result:{}", transaction_id));
        let state = self.state.lock().unwrap();
        state
            .results_by_id
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| NodeError::transport(Some(RpcStatusCode::NotFound), "result not found"))
    }

    async fn get_account_at_block_height(
        &self,
        address: &str,
        height: u64,
        _cancel: &CancellationToken,
    ) -> Result<Account, NodeError> {
        self.record(format!("account:{}:{}", address, height));
        let state = self.state.lock().unwrap();
        state.accounts.get(address).cloned().ok_or_else(|| {
            NodeError::transport(Some(RpcStatusCode::NotFound), "account not found")
        })
    }

    async fn execute_script_at_latest_block(
        &self,
        _code: &str,
        _arguments: Vec<serde_json::Value>,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, NodeError> {
        self.record("script");
        let state = self.state.lock().unwrap();
        state
            .script_result
            .clone()
            .ok_or_else(|| NodeError::transport(Some(RpcStatusCode::Internal), "script failed"))
    }
}
