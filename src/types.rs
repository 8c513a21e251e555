//! Core data model
//!
//! Raw records written by the ingester (blocks, transactions, events),
//! the checkpoint/lease/error bookkeeping rows shared by the derivation
//! engines, and the derived rows each processor emits. Every derived row
//! carries the key that makes re-running its processor idempotent.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A sealed block as stored in the raw table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    /// 32-byte block id, lowercase hex.
    pub id: String,
    pub parent_id: String,
    pub timestamp: DateTime<Utc>,
    pub collection_count: u32,
    pub tx_count: u32,
    pub event_count: u32,
    pub total_gas_used: u64,
    /// Derived from the first seal, when present.
    pub execution_result_id: Option<String>,
    /// Heavy payloads, serialized only when STORE_BLOCK_PAYLOADS is set.
    pub payloads: Option<BlockPayloads>,
    pub sealed: bool,
}

/// Heavy per-block payloads kept out of the hot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPayloads {
    pub collection_guarantees: Option<String>,
    pub seals: Option<String>,
    pub signatures: Option<String>,
}

/// A transaction as stored in the raw table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// 32-byte transaction id, lowercase hex.
    pub id: String,
    pub block_height: u64,
    pub block_id: String,
    pub transaction_index: u32,
    pub proposer: String,
    pub payer: String,
    pub authorizers: Vec<String>,
    pub script: String,
    /// SHA-256 of the script text, lowercase hex.
    pub script_hash: String,
    /// Opaque JSON-CDC argument strings, one per argument.
    pub arguments: Vec<String>,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub status: TransactionStatus,
    pub error_message: Option<String>,
    /// Serialized proposal key / signature blobs.
    pub proposal_key: Option<String>,
    pub payload_signatures: Option<String>,
    pub envelope_signatures: Option<String>,
    /// True iff any event of this transaction is EVM.TransactionExecuted.
    pub is_evm: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Sealed,
    Executed,
    Expired,
    Pending,
    Unknown,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Sealed => "SEALED",
            TransactionStatus::Executed => "EXECUTED",
            TransactionStatus::Expired => "EXPIRED",
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Unknown => "UNKNOWN",
        }
    }
}

/// An event as stored in the raw table. `payload` is the flattened
/// name→scalar map produced by the cadence module, not the wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub transaction_id: String,
    pub transaction_index: u32,
    pub event_index: u32,
    /// `A.<addr>.<contract>.<event>` or `flow.<event>`.
    pub event_type: String,
    pub block_height: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    /// Contract address segment of an `A.<addr>.<contract>.<event>`
    /// type, normalized. Empty for `flow.*` events.
    pub fn contract_address(&self) -> String {
        let parts: Vec<&str> = self.event_type.split('.').collect();
        if parts.len() == 4 && parts[0] == "A" {
            crate::address::normalize_flow_address(parts[1])
        } else {
            String::new()
        }
    }

    /// Contract name segment, empty for `flow.*` events.
    pub fn contract_name(&self) -> &str {
        let parts: Vec<&str> = self.event_type.split('.').collect();
        if parts.len() == 4 && parts[0] == "A" {
            parts[2]
        } else {
            ""
        }
    }

    /// `A.<addr>.<contract>` identifier, empty for `flow.*` events.
    pub fn contract_id(&self) -> String {
        let addr = self.contract_address();
        if addr.is_empty() {
            String::new()
        } else {
            format!("A.{}.{}", addr, self.contract_name())
        }
    }

    /// Payload field as a string, looking through numbers and bools.
    pub fn payload_str(&self, key: &str) -> Option<String> {
        match self.payload.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// One reconciled block payload returned by the fetch layer.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub block: Block,
    pub transactions: Vec<Transaction>,
    pub events: Vec<Event>,
    pub warnings: Vec<FetchWarning>,
}

/// A recoverable oddity observed while fetching a block. Does not fail
/// the block; persisted to the indexing error log for later repair.
#[derive(Debug, Clone)]
pub struct FetchWarning {
    pub tx_id: Option<String>,
    pub tx_index: Option<u32>,
    pub message: String,
}

impl FetchWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            tx_id: None,
            tx_index: None,
            message: message.into(),
        }
    }

    pub fn for_tx(tx_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tx_id: Some(tx_id.into()),
            tx_index: None,
            message: message.into(),
        }
    }
}

/// Status of a derivation lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Active,
    Completed,
    Failed,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Active => "ACTIVE",
            LeaseStatus::Completed => "COMPLETED",
            LeaseStatus::Failed => "FAILED",
        }
    }
}

/// A row asserting exclusive ownership of `[from_height, to_height)` by
/// one worker instance. At most one ACTIVE lease per (worker_type,
/// from, to); both bounds are aligned to the worker's range size.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: u64,
    pub worker_type: String,
    pub from_height: u64,
    pub to_height: u64,
    pub status: LeaseStatus,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempt: u32,
    pub last_error: Option<String>,
}

/// Append-only indexing error log row; drives the repair loop.
#[derive(Debug, Clone)]
pub struct IndexingErrorRow {
    pub id: u64,
    pub worker_type: String,
    pub block_height: u64,
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Missing range between adjacent completed leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGap {
    pub from_height: u64,
    pub to_height: u64,
}

/// Raw table extent: lowest and highest stored heights plus the tip
/// timestamp.
#[derive(Debug, Clone, Copy)]
pub struct BlockRange {
    pub min_height: u64,
    pub max_height: u64,
    pub max_timestamp: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------
// Derived rows
// ---------------------------------------------------------------------

/// Direction of a paired token movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    /// Withdraw and deposit legs paired within one transaction.
    Transfer,
    /// Deposit leg only.
    Mint,
    /// Withdraw leg only.
    Burn,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Transfer => "TRANSFER",
            TransferKind::Mint => "MINT",
            TransferKind::Burn => "BURN",
        }
    }
}

/// One FT or NFT transfer, keyed by (transaction_id, event_index) of
/// its primary leg (the deposit when present, the withdraw otherwise).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub transaction_id: String,
    pub event_index: u32,
    pub block_height: u64,
    pub timestamp: DateTime<Utc>,
    /// `A.<addr>.<contract>` of the token contract.
    pub contract_id: String,
    pub contract_address: String,
    pub contract_name: String,
    pub from_address: String,
    pub to_address: String,
    /// Decimal string; empty for NFTs.
    pub amount: String,
    /// Token id for NFTs; empty for FTs.
    pub nft_id: String,
    pub is_nft: bool,
    pub kind: TransferKind,
}

/// Signed balance delta applied to FT holdings.
#[derive(Debug, Clone)]
pub struct FtHoldingDelta {
    pub address: String,
    pub contract_id: String,
    pub contract_name: String,
    /// Signed decimal string.
    pub delta: String,
    pub block_height: u64,
}

/// Latest owner of one NFT.
#[derive(Debug, Clone)]
pub struct NftOwnership {
    pub contract_id: String,
    pub contract_name: String,
    pub nft_id: String,
    pub owner: String,
    pub block_height: u64,
    pub transaction_id: String,
}

/// Per-day signed balance delta, keyed by (address, contract, date).
#[derive(Debug, Clone)]
pub struct DailyBalanceDelta {
    pub address: String,
    pub contract_id: String,
    pub contract_name: String,
    pub date: NaiveDate,
    pub delta: String,
}

/// Accounts catalog row.
#[derive(Debug, Clone)]
pub struct AccountRow {
    pub address: String,
    pub first_seen_height: u64,
    pub last_seen_height: u64,
}

/// Cadence-owned EVM account: the EVM address plus the Flow account
/// that controls it.
#[derive(Debug, Clone)]
pub struct CoaAccountRow {
    pub evm_address: String,
    pub flow_address: String,
    pub block_height: u64,
    pub transaction_id: String,
}

/// EVM transaction extracted from an EVM.TransactionExecuted event.
#[derive(Debug, Clone)]
pub struct EvmTxHashRow {
    pub block_height: u64,
    pub transaction_id: String,
    pub event_index: u32,
    /// Lowercase hex, no 0x prefix.
    pub evm_hash: String,
    pub from_address: String,
    pub to_address: String,
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
    /// Decimal string (wei).
    pub value: Option<String>,
    pub chain_id: Option<u64>,
    pub input_data: Option<String>,
    pub logs_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKeyAction {
    Added,
    Removed,
}

/// Account key add/remove extracted from flow.AccountKey* events.
#[derive(Debug, Clone)]
pub struct AccountKeyRow {
    pub address: String,
    pub key_index: u32,
    pub public_key: Option<String>,
    pub action: AccountKeyAction,
    pub block_height: u64,
    pub transaction_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractAction {
    Added,
    Updated,
}

/// Contract deploy/update extracted from flow.AccountContract* events.
#[derive(Debug, Clone)]
pub struct SmartContractRow {
    pub address: String,
    pub name: String,
    pub action: ContractAction,
    /// Source text, fetched opportunistically when STORE_CONTRACT_CODE.
    pub code: Option<String>,
    pub block_height: u64,
    pub transaction_id: String,
}

/// Token contract registry row, keyed by contract id.
#[derive(Debug, Clone)]
pub struct ContractRegistryRow {
    pub contract_id: String,
    pub contract_address: String,
    pub contract_name: String,
    pub is_nft: bool,
    pub first_seen_height: u64,
}

/// Per-address transaction index row.
#[derive(Debug, Clone)]
pub struct AddressTransactionRow {
    pub address: String,
    pub transaction_id: String,
    pub block_height: u64,
    /// proposer | payer | authorizer | sender | receiver
    pub role: String,
    pub timestamp: DateTime<Utc>,
}

/// Staking event row (delegation, rewards, node lifecycle).
#[derive(Debug, Clone)]
pub struct StakingEventRow {
    pub event_type: String,
    pub node_id: String,
    pub delegator_id: Option<u32>,
    pub amount: String,
    pub block_height: u64,
    pub transaction_id: String,
    pub event_index: u32,
}

/// Known staking node, keyed by node id.
#[derive(Debug, Clone)]
pub struct StakingNodeRow {
    pub node_id: String,
    pub role: Option<u8>,
    pub last_event_height: u64,
}

/// Per-epoch staking aggregate.
#[derive(Debug, Clone)]
pub struct EpochStatsRow {
    pub epoch: u64,
    pub total_staked: String,
    pub total_rewarded: String,
    pub block_height: u64,
}

/// DEX event row (swap / liquidity add / liquidity remove).
#[derive(Debug, Clone)]
pub struct DefiEventRow {
    pub pair_id: String,
    pub kind: String,
    pub amount0: String,
    pub amount1: String,
    pub block_height: u64,
    pub transaction_id: String,
    pub event_index: u32,
}

/// DEX pair registry row, keyed by pair id.
#[derive(Debug, Clone)]
pub struct DefiPairRow {
    pub pair_id: String,
    pub contract_address: String,
    pub token0: String,
    pub token1: String,
    pub first_seen_height: u64,
}

/// Token metadata fetched via Cadence scripts, keyed by contract id.
#[derive(Debug, Clone)]
pub struct TokenMetadataRow {
    pub contract_id: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
    pub description: Option<String>,
    pub logo_url: Option<String>,
    pub is_nft: bool,
}

/// Script-import row: one contract imported by one transaction.
#[derive(Debug, Clone)]
pub struct TxContractRow {
    pub transaction_id: String,
    pub contract_id: String,
    pub block_height: u64,
}

/// Classification tag attached to a transaction.
#[derive(Debug, Clone)]
pub struct TxTagRow {
    pub transaction_id: String,
    pub tag: String,
    pub block_height: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_of_type(event_type: &str) -> Event {
        Event {
            transaction_id: "ab".repeat(32),
            transaction_index: 0,
            event_index: 0,
            event_type: event_type.to_string(),
            block_height: 1,
            timestamp: Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn test_event_contract_parts() {
        let ev = event_of_type("A.1654653399040a61.FlowToken.TokensDeposited");
        assert_eq!(ev.contract_address(), "1654653399040a61");
        assert_eq!(ev.contract_name(), "FlowToken");
        assert_eq!(ev.contract_id(), "A.1654653399040a61.FlowToken");
    }

    #[test]
    fn test_flow_event_has_no_contract() {
        let ev = event_of_type("flow.AccountCreated");
        assert_eq!(ev.contract_address(), "");
        assert_eq!(ev.contract_name(), "");
        assert_eq!(ev.contract_id(), "");
    }
}
