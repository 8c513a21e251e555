//! EVM transaction extraction
//!
//! Every `EVM.TransactionExecuted` event carries the embedded-EVM
//! transaction: its hash under one of several historical field names
//! (string or byte array), and usually the RLP-encoded transaction
//! itself in the `payload` field. The worker extracts the hash, decodes
//! what the RLP offers (legacy and EIP-1559 envelopes), and upserts one
//! row per event keyed by (block_height, transaction_id, event_index).

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::address::normalize_evm_address;
use crate::error::BoxError;
use crate::processor::{Processor, ProcessorContext, EVM_WORKER};
use crate::types::{Event, EvmTxHashRow};

/// Field names the hash has been published under across event
/// versions.
const HASH_KEYS: &[&str] = &["hash", "transactionHash", "txHash", "evmHash"];

/// Pull the EVM hash out of a flattened payload: a `0x…` string, a
/// bare hex string, or a byte array (numbers or numeric strings). The
/// result is lowercase hex without the prefix.
pub fn extract_evm_hash(payload: &Value) -> Option<String> {
    for key in HASH_KEYS {
        let Some(value) = payload.get(key) else { continue };
        match value {
            Value::String(s) => {
                let s = s.trim().trim_start_matches("0x").to_lowercase();
                if !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Some(s);
                }
            }
            Value::Array(items) => {
                if let Some(bytes) = bytes_from_array(items) {
                    return Some(hex::encode(bytes));
                }
            }
            _ => {}
        }
    }
    None
}

/// Byte array in either wire shape: JSON numbers or the flattened
/// integer-as-string form.
fn bytes_from_array(items: &[Value]) -> Option<Vec<u8>> {
    let mut bytes = Vec::with_capacity(items.len());
    for item in items {
        let byte = match item {
            Value::Number(n) => n.as_u64().filter(|v| *v <= 255)? as u8,
            Value::String(s) => s.parse::<u8>().ok()?,
            _ => return None,
        };
        bytes.push(byte);
    }
    if bytes.is_empty() {
        None
    } else {
        Some(bytes)
    }
}

/// What the RLP payload yields; every field optional because payloads
/// predating the current event shape omit most of them.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DecodedEvmTx {
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
    pub to: Option<String>,
    pub value: Option<String>,
    pub input_data: Option<String>,
    pub chain_id: Option<u64>,
}

/// Decode a legacy or EIP-1559 transaction envelope. Unknown typed
/// envelopes and garbage decode to None rather than failing the event.
pub fn decode_rlp_payload(bytes: &[u8]) -> Option<DecodedEvmTx> {
    if bytes.is_empty() {
        return None;
    }
    // Typed envelope: one type byte, then an RLP list.
    let (type_byte, body) = if bytes[0] <= 0x7f {
        (Some(bytes[0]), &bytes[1..])
    } else {
        (None, bytes)
    };
    let rlp = rlp::Rlp::new(body);
    if !rlp.is_list() {
        return None;
    }

    // Legacy: [nonce, gasPrice, gasLimit, to, value, data, v, r, s]
    // 1559:   [chainId, nonce, maxPriorityFee, maxFee, gasLimit, to, value, data, ...]
    let (chain_idx, nonce_idx, gas_idx, to_idx, value_idx, data_idx) = match type_byte {
        Some(0x02) => (Some(0usize), 1usize, 4usize, 5usize, 6usize, 7usize),
        Some(0x01) => (Some(0), 1, 3, 4, 5, 6),
        Some(_) => return None,
        None => (None, 0, 2, 3, 4, 5),
    };

    let u64_at = |i: usize| rlp.val_at::<u64>(i).ok();
    let bytes_at = |i: usize| rlp.val_at::<Vec<u8>>(i).ok();

    Some(DecodedEvmTx {
        nonce: u64_at(nonce_idx),
        gas_limit: u64_at(gas_idx),
        to: bytes_at(to_idx).map(|b| hex::encode(b)).filter(|s| !s.is_empty()),
        value: bytes_at(value_idx).map(big_endian_decimal),
        input_data: bytes_at(data_idx)
            .filter(|b| !b.is_empty())
            .map(|b| format!("0x{}", hex::encode(b))),
        chain_id: chain_idx.and_then(u64_at),
    })
}

/// Big-endian byte string to decimal, for wei values wider than u64.
fn big_endian_decimal(bytes: Vec<u8>) -> String {
    use bigdecimal::num_bigint::BigUint;
    BigUint::from_bytes_be(&bytes).to_string()
}

/// RLP payload location in the flattened event, as bytes.
fn rlp_bytes(payload: &Value) -> Option<Vec<u8>> {
    match payload.get("payload")? {
        Value::String(s) => {
            let s = s.trim().trim_start_matches("0x");
            hex::decode(s).ok()
        }
        Value::Array(items) => bytes_from_array(items),
        _ => None,
    }
}

pub struct EvmProcessor {
    ctx: ProcessorContext,
}

impl EvmProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }

    fn row_for(event: &Event) -> Option<EvmTxHashRow> {
        let evm_hash = extract_evm_hash(&event.payload)?;
        let decoded = rlp_bytes(&event.payload)
            .and_then(|bytes| decode_rlp_payload(&bytes))
            .unwrap_or_default();

        let from_address = event
            .payload_str("from")
            .map(|s| normalize_evm_address(&s))
            .unwrap_or_default();
        let to_address = decoded
            .to
            .clone()
            .or_else(|| event.payload_str("to"))
            .map(|s| normalize_evm_address(&s))
            .unwrap_or_default();
        let logs_count = event
            .payload
            .get("logs")
            .and_then(|l| l.as_array())
            .map(|l| l.len() as u32)
            .unwrap_or(0);

        Some(EvmTxHashRow {
            block_height: event.block_height,
            transaction_id: event.transaction_id.clone(),
            event_index: event.event_index,
            evm_hash,
            from_address,
            to_address,
            nonce: decoded.nonce,
            gas_limit: decoded.gas_limit,
            value: decoded.value,
            chain_id: decoded.chain_id,
            input_data: decoded.input_data,
            logs_count,
        })
    }
}

#[async_trait]
impl Processor for EvmProcessor {
    fn name(&self) -> &'static str {
        EVM_WORKER
    }

    async fn process_range(
        &self,
        from: u64,
        to: u64,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let repo = &self.ctx.repository;
        let events = repo.get_raw_events_in_range(from, to).await?;
        let rows: Vec<EvmTxHashRow> = events
            .iter()
            .filter(|e| e.event_type.contains("EVM.TransactionExecuted"))
            .filter_map(Self::row_for)
            .collect();
        if rows.is_empty() {
            return Ok(());
        }
        repo.ensure_app_partitions(from, to).await?;
        repo.upsert_evm_tx_hashes(&rows).await?;
        Ok(())
    }
}
