//! HTTP access node client
//!
//! `NodeClient` over the access node REST API. The REST surface serves
//! event payloads as base64 JSON-CDC natively, so the raw-wire variants
//! are the same calls minus the transcode step. HTTP and body-level
//! failures map onto the `NodeError` taxonomy; response bodies ride
//! along in the message so spork-root phrasing stays detectable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, RpcStatusCode};
use crate::node_client::*;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpNodeClient {
    endpoint: String,
    node_index: usize,
    http: reqwest::Client,
}

impl HttpNodeClient {
    pub fn new(endpoint: impl Into<String>, node_index: usize) -> Result<Self, NodeError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NodeError::transport(None, format!("http client build: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            node_index,
            http,
        })
    }

    async fn get_json(&self, path: &str, cancel: &CancellationToken) -> Result<Value, NodeError> {
        let url = format!("{}{}", self.endpoint, path);
        let request = async {
            let response = self.http.get(&url).send().await.map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    NodeError::NodeUnavailable {
                        node_index: self.node_index,
                        message: e.to_string(),
                    }
                } else {
                    NodeError::transport(None, e.to_string())
                }
            })?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| NodeError::transport(None, e.to_string()))?;
            if !status.is_success() {
                return Err(classify_http_error(
                    status.as_u16(),
                    &body,
                    &self.endpoint,
                    self.node_index,
                ));
            }
            serde_json::from_str(&body)
                .map_err(|e| NodeError::decode(format!("response not JSON: {}", e)))
        };
        with_cancel(cancel, request).await
    }

    async fn post_json(
        &self,
        path: &str,
        body: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, NodeError> {
        let url = format!("{}{}", self.endpoint, path);
        let request = async {
            let response = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| NodeError::transport(None, e.to_string()))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| NodeError::transport(None, e.to_string()))?;
            if !status.is_success() {
                return Err(classify_http_error(
                    status.as_u16(),
                    &text,
                    &self.endpoint,
                    self.node_index,
                ));
            }
            serde_json::from_str(&text)
                .map_err(|e| NodeError::decode(format!("response not JSON: {}", e)))
        };
        with_cancel(cancel, request).await
    }
}

/// REST status → error taxonomy. The body text is preserved so
/// boundary phrasings ("spork root block height N") survive.
pub fn classify_http_error(
    status: u16,
    body: &str,
    endpoint: &str,
    node_index: usize,
) -> NodeError {
    if body.contains("spork root block height") {
        return NodeError::SporkRootNotFound {
            node: endpoint.to_string(),
            root_height: crate::error::parse_spork_root_height(body),
        };
    }
    match status {
        404 => NodeError::transport(Some(RpcStatusCode::NotFound), body.to_string()),
        501 => NodeError::transport(Some(RpcStatusCode::Unimplemented), body.to_string()),
        429 => NodeError::NodeExhausted {
            node: endpoint.to_string(),
        },
        408 | 504 => NodeError::transport(Some(RpcStatusCode::DeadlineExceeded), body.to_string()),
        502 | 503 => NodeError::NodeUnavailable {
            node_index,
            message: body.to_string(),
        },
        500 => NodeError::transport(Some(RpcStatusCode::Internal), body.to_string()),
        _ => NodeError::transport(Some(RpcStatusCode::Unknown), format!("{}: {}", status, body)),
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string()
}

fn u64_field(value: &Value, key: &str) -> u64 {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

fn timestamp_field(value: &Value, key: &str) -> DateTime<Utc> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Block response → header. The REST shape nests the header fields
/// under "header" and the guarantees/seals under "payload".
pub fn parse_block_header(value: &Value) -> Result<BlockHeader, NodeError> {
    let header = value.get("header").unwrap_or(value);
    let height = u64_field(header, "height");
    let id = str_field(header, "id");
    if id.is_empty() {
        return Err(NodeError::decode("block response without id"));
    }
    let payload = value.get("payload");
    let collection_guarantees = payload
        .and_then(|p| p.get("collection_guarantees"))
        .and_then(|g| g.as_array())
        .map(|arr| {
            arr.iter()
                .map(|g| CollectionGuarantee {
                    collection_id: str_field(g, "collection_id"),
                })
                .collect()
        })
        .unwrap_or_default();
    let seals = payload
        .and_then(|p| p.get("block_seals"))
        .and_then(|s| s.as_array())
        .map(|arr| {
            arr.iter()
                .map(|s| BlockSeal {
                    block_id: str_field(s, "block_id"),
                    execution_result_id: str_field(s, "result_id"),
                })
                .collect()
        })
        .unwrap_or_default();
    let signatures = header
        .get("parent_voter_signature")
        .and_then(|v| v.as_str())
        .map(|s| vec![s.to_string()])
        .unwrap_or_default();

    Ok(BlockHeader {
        height,
        id,
        parent_id: str_field(header, "parent_id"),
        timestamp: timestamp_field(header, "timestamp"),
        collection_guarantees,
        seals,
        signatures,
        sealed: true,
    })
}

pub fn parse_transaction(value: &Value) -> WireTransaction {
    let script = value
        .get("script")
        .and_then(|s| s.as_str())
        .map(|s| {
            // Script text is base64 on the wire.
            base64::decode(s)
                .ok()
                .and_then(|b| String::from_utf8(b).ok())
                .unwrap_or_else(|| s.to_string())
        })
        .unwrap_or_default();
    let arguments = value
        .get("arguments")
        .and_then(|a| a.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    let authorizers = value
        .get("authorizers")
        .and_then(|a| a.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    WireTransaction {
        id: str_field(value, "id"),
        script,
        arguments,
        proposer: value
            .get("proposal_key")
            .map(|p| str_field(p, "address"))
            .unwrap_or_default(),
        payer: str_field(value, "payer"),
        authorizers,
        gas_limit: u64_field(value, "gas_limit"),
        proposal_key: value.get("proposal_key").map(|p| p.to_string()),
        payload_signatures: value.get("payload_signatures").map(|s| s.to_string()),
        envelope_signatures: value.get("envelope_signatures").map(|s| s.to_string()),
    }
}

pub fn parse_transaction_result(value: &Value) -> WireTransactionResult {
    let events = value
        .get("events")
        .and_then(|e| e.as_array())
        .map(|arr| {
            arr.iter()
                .map(|ev| WireEvent {
                    event_type: str_field(ev, "type"),
                    transaction_id: str_field(ev, "transaction_id"),
                    transaction_index: u64_field(ev, "transaction_index") as u32,
                    event_index: u64_field(ev, "event_index") as u32,
                    payload: str_field(ev, "payload").into_bytes(),
                })
                .collect()
        })
        .unwrap_or_default();
    let tx_id = str_field(value, "transaction_id");
    WireTransactionResult {
        transaction_id: if tx_id.is_empty() { None } else { Some(tx_id) },
        status: str_field(value, "status"),
        error_message: str_field(value, "error_message"),
        computation_used: u64_field(value, "computation_used"),
        events,
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn get_latest_block_height(&self, cancel: &CancellationToken) -> Result<u64, NodeError> {
        let value = self.get_json("/v1/blocks?height=sealed", cancel).await?;
        let block = value
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| NodeError::decode("empty sealed block response"))?;
        let header = block.get("header").unwrap_or(block);
        Ok(u64_field(header, "height"))
    }

    async fn get_block_header_by_height(
        &self,
        height: u64,
        cancel: &CancellationToken,
    ) -> Result<BlockHeader, NodeError> {
        let value = self
            .get_json(&format!("/v1/blocks?height={}&expand=payload", height), cancel)
            .await?;
        let block = value
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| {
                NodeError::transport(Some(RpcStatusCode::NotFound), "block not found")
            })?;
        parse_block_header(block)
    }

    async fn get_collection(
        &self,
        collection_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Collection, NodeError> {
        let value = self
            .get_json(&format!("/v1/collections/{}", collection_id), cancel)
            .await?;
        let transaction_ids = value
            .get("transaction_ids")
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Collection {
            id: str_field(&value, "id"),
            transaction_ids,
        })
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WireTransaction, NodeError> {
        let value = self
            .get_json(&format!("/v1/transactions/{}", transaction_id), cancel)
            .await?;
        Ok(parse_transaction(&value))
    }

    async fn get_transactions_by_block_id(
        &self,
        block_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<WireTransaction>, NodeError> {
        let value = self
            .get_json(&format!("/v1/blocks/{}/transactions", block_id), cancel)
            .await?;
        let arr = value
            .as_array()
            .ok_or_else(|| NodeError::decode("transactions response not a list"))?;
        Ok(arr.iter().map(parse_transaction).collect())
    }

    async fn get_transaction_result(
        &self,
        transaction_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WireTransactionResult, NodeError> {
        let value = self
            .get_json(&format!("/v1/transaction_results/{}", transaction_id), cancel)
            .await?;
        Ok(parse_transaction_result(&value))
    }

    async fn get_transaction_result_by_index(
        &self,
        block_id: &str,
        index: u32,
        cancel: &CancellationToken,
    ) -> Result<WireTransactionResult, NodeError> {
        let value = self
            .get_json(
                &format!("/v1/blocks/{}/transaction_results/{}", block_id, index),
                cancel,
            )
            .await?;
        Ok(parse_transaction_result(&value))
    }

    async fn get_transaction_results_by_block_id(
        &self,
        block_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<WireTransactionResult>, NodeError> {
        let value = self
            .get_json(&format!("/v1/transaction_results?block_id={}", block_id), cancel)
            .await?;
        let arr = value
            .as_array()
            .ok_or_else(|| NodeError::decode("results response not a list"))?;
        Ok(arr.iter().map(parse_transaction_result).collect())
    }

    async fn get_transaction_results_by_block_id_raw(
        &self,
        block_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<WireTransactionResult>, NodeError> {
        // REST serves JSON-CDC payloads natively; the raw path is the
        // same wire call without the typed transcode.
        self.get_transaction_results_by_block_id(block_id, cancel)
            .await
    }

    async fn get_transaction_result_raw(
        &self,
        transaction_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WireTransactionResult, NodeError> {
        self.get_transaction_result(transaction_id, cancel).await
    }

    async fn get_account_at_block_height(
        &self,
        address: &str,
        height: u64,
        cancel: &CancellationToken,
    ) -> Result<Account, NodeError> {
        let value = self
            .get_json(
                &format!(
                    "/v1/accounts/{}?block_height={}&expand=contracts",
                    address, height
                ),
                cancel,
            )
            .await?;
        let mut contracts = HashMap::new();
        if let Some(map) = value.get("contracts").and_then(|c| c.as_object()) {
            for (name, code) in map {
                if let Some(code) = code.as_str() {
                    let source = base64::decode(code)
                        .ok()
                        .and_then(|b| String::from_utf8(b).ok())
                        .unwrap_or_else(|| code.to_string());
                    contracts.insert(name.clone(), source);
                }
            }
        }
        Ok(Account {
            address: str_field(&value, "address"),
            balance: u64_field(&value, "balance"),
            contracts,
        })
    }

    async fn execute_script_at_latest_block(
        &self,
        code: &str,
        arguments: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, NodeError> {
        let encoded_args: Vec<String> = arguments
            .iter()
            .map(|a| base64::encode(a.to_string()))
            .collect();
        let body = serde_json::json!({
            "script": base64::encode(code),
            "arguments": encoded_args,
        });
        let value = self
            .post_json("/v1/scripts?block_height=sealed", body, cancel)
            .await?;
        // The result is a base64 JSON-CDC value.
        let Some(encoded) = value.as_str() else {
            return Ok(value);
        };
        let decoded = base64::decode(encoded)
            .map_err(|e| NodeError::decode(format!("script result not base64: {}", e)))?;
        serde_json::from_slice(&decoded)
            .map_err(|e| NodeError::decode(format!("script result not JSON-CDC: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_http_error_classification() {
        assert!(matches!(
            classify_http_error(404, "not found", "an", 0).status_code(),
            Some(RpcStatusCode::NotFound)
        ));
        assert!(classify_http_error(501, "nope", "an", 0).is_unimplemented());
        assert!(classify_http_error(429, "slow down", "an", 0).is_resource_exhausted());
        assert!(matches!(
            classify_http_error(503, "maintenance", "an", 2),
            NodeError::NodeUnavailable { node_index: 2, .. }
        ));
    }

    #[test]
    fn test_spork_root_body_wins_over_status() {
        let err = classify_http_error(
            400,
            "invalid height: spork root block height 65264619",
            "an",
            0,
        );
        assert!(err.indicates_spork_boundary());
        assert_eq!(err.spork_root_height(), Some(65264619));
    }

    #[test]
    fn test_parse_block_header() {
        let value = json!({
            "header": {
                "id": "abc123",
                "parent_id": "def456",
                "height": "85981135",
                "timestamp": "2025-06-01T12:00:00Z",
                "parent_voter_signature": "c2ln"
            },
            "payload": {
                "collection_guarantees": [{"collection_id": "c1"}],
                "block_seals": [{"block_id": "abc122", "result_id": "r1"}]
            }
        });
        let header = parse_block_header(&value).unwrap();
        assert_eq!(header.height, 85981135);
        assert_eq!(header.id, "abc123");
        assert_eq!(header.collection_guarantees.len(), 1);
        assert_eq!(header.seals[0].execution_result_id, "r1");
        assert_eq!(header.timestamp.to_rfc3339(), "2025-06-01T12:00:00+00:00");
    }

    #[test]
    fn test_parse_block_header_requires_id() {
        assert!(parse_block_header(&json!({"header": {"height": "5"}})).is_err());
    }

    #[test]
    fn test_parse_transaction_decodes_script() {
        let value = json!({
            "id": "t1",
            "script": base64::encode("transaction {}"),
            "arguments": [],
            "payer": "f919ee77447b7497",
            "proposal_key": {"address": "1e3c78c6d580273b", "key_index": "0"},
            "authorizers": ["1e3c78c6d580273b"],
            "gas_limit": "9999"
        });
        let tx = parse_transaction(&value);
        assert_eq!(tx.script, "transaction {}");
        assert_eq!(tx.proposer, "1e3c78c6d580273b");
        assert_eq!(tx.gas_limit, 9999);
        assert!(tx.proposal_key.is_some());
    }

    #[test]
    fn test_parse_transaction_result() {
        let value = json!({
            "transaction_id": "t1",
            "status": "Sealed",
            "error_message": "",
            "computation_used": "42",
            "events": [{
                "type": "flow.AccountCreated",
                "transaction_id": "t1",
                "transaction_index": "0",
                "event_index": "0",
                "payload": "eyJ0eXBlIjoiRXZlbnQifQ=="
            }]
        });
        let result = parse_transaction_result(&value);
        assert_eq!(result.transaction_id.as_deref(), Some("t1"));
        assert_eq!(result.computation_used, 42);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].event_type, "flow.AccountCreated");
    }
}
