//! JSON-CDC payload handling
//!
//! Event payloads arrive as JSON-CDC: a typed tree of
//! `{"type": ..., "value": ...}` nodes. Processors want flat maps of
//! plain scalars, so everything funnels through the flattener here:
//! strings stay strings, booleans stay booleans, every integer family
//! becomes its decimal string (256-bit values do not fit a JSON
//! number), addresses normalize to canonical hex, optionals resolve to
//! their inner value or null.
//!
//! The strict decoder rejects malformed trees and is known to blow up
//! on some historical payloads, so callers run it inside a narrow
//! panic-safe region and fall back to the lossy extractor, which walks
//! the same encoding but never fails.

use serde_json::{Map, Value};

use crate::address::normalize_flow_address;
use crate::error::NodeError;

/// Decode a wire payload (raw JSON-CDC bytes, possibly base64-wrapped)
/// into `(event_type, flattened_fields)` using the strict decoder.
pub fn decode_event_payload(raw: &[u8]) -> Result<(Option<String>, Value), NodeError> {
    let tree = parse_payload_bytes(raw)?;
    let event_type = tree
        .get("value")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let flattened = flatten_strict(&tree)?;
    Ok((event_type, flattened))
}

/// Decode a wire payload with the panic-safe fallback ladder: strict
/// decode first, lossy extraction when the strict path errors or
/// panics.
pub fn decode_event_payload_safe(raw: &[u8]) -> (Option<String>, Value) {
    let strict = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        decode_event_payload(raw)
    }));
    match strict {
        Ok(Ok(decoded)) => decoded,
        _ => {
            let tree = match parse_payload_bytes(raw) {
                Ok(t) => t,
                Err(_) => return (None, Value::Object(Map::new())),
            };
            let event_type = tree
                .get("value")
                .and_then(|v| v.get("id"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            (event_type, extract_lossy(&tree))
        }
    }
}

/// Payloads come either as plain JSON bytes or base64 of the same.
fn parse_payload_bytes(raw: &[u8]) -> Result<Value, NodeError> {
    if let Ok(v) = serde_json::from_slice::<Value>(raw) {
        return Ok(v);
    }
    let text = std::str::from_utf8(raw)
        .map_err(|e| NodeError::decode(format!("payload not utf8: {}", e)))?;
    let decoded = base64::decode(text.trim())
        .map_err(|e| NodeError::decode(format!("payload not base64: {}", e)))?;
    serde_json::from_slice(&decoded)
        .map_err(|e| NodeError::decode(format!("payload not JSON-CDC: {}", e)))
}

/// Strict flattening of a JSON-CDC node. Unknown or malformed nodes
/// are errors.
pub fn flatten_strict(node: &Value) -> Result<Value, NodeError> {
    let ty = node
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| NodeError::decode("JSON-CDC node missing type"))?;
    let value = node.get("value");

    match ty {
        "Event" | "Struct" | "Resource" | "Enum" => {
            let fields = value
                .and_then(|v| v.get("fields"))
                .and_then(|f| f.as_array())
                .ok_or_else(|| NodeError::decode("composite without fields"))?;
            let mut out = Map::new();
            for field in fields {
                let name = field
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| NodeError::decode("field without name"))?;
                let inner = field
                    .get("value")
                    .ok_or_else(|| NodeError::decode("field without value"))?;
                out.insert(name.to_string(), flatten_strict(inner)?);
            }
            Ok(Value::Object(out))
        }
        "Dictionary" => {
            let entries = value
                .and_then(|v| v.as_array())
                .ok_or_else(|| NodeError::decode("dictionary without entries"))?;
            let mut out = Map::new();
            for entry in entries {
                let key = entry
                    .get("key")
                    .map(flatten_strict)
                    .transpose()?
                    .map(scalar_to_key)
                    .ok_or_else(|| NodeError::decode("dictionary entry without key"))?;
                let val = entry
                    .get("value")
                    .map(flatten_strict)
                    .transpose()?
                    .ok_or_else(|| NodeError::decode("dictionary entry without value"))?;
                out.insert(key, val);
            }
            Ok(Value::Object(out))
        }
        "Array" => {
            let items = value
                .and_then(|v| v.as_array())
                .ok_or_else(|| NodeError::decode("array without items"))?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(flatten_strict(item)?);
            }
            Ok(Value::Array(out))
        }
        "Optional" => match value {
            Some(Value::Null) | None => Ok(Value::Null),
            Some(inner) => flatten_strict(inner),
        },
        "Address" => {
            let addr = value
                .and_then(|v| v.as_str())
                .ok_or_else(|| NodeError::decode("address without string value"))?;
            Ok(Value::String(normalize_flow_address(addr)))
        }
        "String" | "Character" => {
            let s = value
                .and_then(|v| v.as_str())
                .ok_or_else(|| NodeError::decode("string without value"))?;
            Ok(Value::String(s.to_string()))
        }
        "Bool" => {
            let b = value
                .and_then(|v| v.as_bool())
                .ok_or_else(|| NodeError::decode("bool without value"))?;
            Ok(Value::Bool(b))
        }
        "UFix64" | "Fix64" => {
            let s = value
                .and_then(|v| v.as_str())
                .ok_or_else(|| NodeError::decode("fixed-point without value"))?;
            Ok(Value::String(s.to_string()))
        }
        "Path" => {
            let domain = value
                .and_then(|v| v.get("domain"))
                .and_then(|d| d.as_str())
                .unwrap_or("");
            let identifier = value
                .and_then(|v| v.get("identifier"))
                .and_then(|i| i.as_str())
                .unwrap_or("");
            Ok(Value::String(format!("/{}/{}", domain, identifier)))
        }
        "Type" => {
            let id = value
                .and_then(|v| v.get("staticType"))
                .map(|st| match st {
                    Value::String(s) => s.clone(),
                    other => other
                        .get("typeID")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
                .unwrap_or_default();
            Ok(Value::String(id))
        }
        "Capability" => {
            let mut out = Map::new();
            if let Some(addr) = value.and_then(|v| v.get("address")).and_then(|a| a.as_str()) {
                out.insert(
                    "address".to_string(),
                    Value::String(normalize_flow_address(addr)),
                );
            }
            if let Some(id) = value.and_then(|v| v.get("id")) {
                out.insert("id".to_string(), flatten_strict(id).unwrap_or(Value::Null));
            }
            Ok(Value::Object(out))
        }
        // Every integer family serializes its value as a decimal string.
        t if t.starts_with("Int") || t.starts_with("UInt") || t.starts_with("Word") => {
            let s = match value {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return Err(NodeError::decode(format!("{} without value", t))),
            };
            Ok(Value::String(s))
        }
        other => Err(NodeError::decode(format!("unhandled JSON-CDC type {}", other))),
    }
}

/// Lossy extraction: same shape as the strict flattener, but unknown
/// nodes degrade to null and malformed nodes are skipped instead of
/// failing the event.
pub fn extract_lossy(node: &Value) -> Value {
    let ty = node.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let value = node.get("value");

    match ty {
        "Event" | "Struct" | "Resource" | "Enum" => {
            let mut out = Map::new();
            if let Some(fields) = value.and_then(|v| v.get("fields")).and_then(|f| f.as_array()) {
                for field in fields {
                    if let (Some(name), Some(inner)) = (
                        field.get("name").and_then(|n| n.as_str()),
                        field.get("value"),
                    ) {
                        out.insert(name.to_string(), extract_lossy(inner));
                    }
                }
            }
            Value::Object(out)
        }
        "Dictionary" => {
            let mut out = Map::new();
            if let Some(entries) = value.and_then(|v| v.as_array()) {
                for entry in entries {
                    let key = entry.get("key").map(extract_lossy).map(scalar_to_key);
                    let val = entry.get("value").map(extract_lossy);
                    if let (Some(key), Some(val)) = (key, val) {
                        out.insert(key, val);
                    }
                }
            }
            Value::Object(out)
        }
        "Array" => Value::Array(
            value
                .and_then(|v| v.as_array())
                .map(|items| items.iter().map(extract_lossy).collect())
                .unwrap_or_default(),
        ),
        "Optional" => match value {
            Some(Value::Null) | None => Value::Null,
            Some(inner) => extract_lossy(inner),
        },
        "Address" => Value::String(
            value
                .and_then(|v| v.as_str())
                .map(normalize_flow_address)
                .unwrap_or_default(),
        ),
        "String" | "Character" | "UFix64" | "Fix64" => Value::String(
            value
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        ),
        "Bool" => Value::Bool(value.and_then(|v| v.as_bool()).unwrap_or(false)),
        "Path" => {
            let domain = value
                .and_then(|v| v.get("domain"))
                .and_then(|d| d.as_str())
                .unwrap_or("");
            let identifier = value
                .and_then(|v| v.get("identifier"))
                .and_then(|i| i.as_str())
                .unwrap_or("");
            Value::String(format!("/{}/{}", domain, identifier))
        }
        t if t.starts_with("Int") || t.starts_with("UInt") || t.starts_with("Word") => {
            match value {
                Some(Value::String(s)) => Value::String(s.clone()),
                Some(Value::Number(n)) => Value::String(n.to_string()),
                _ => Value::Null,
            }
        }
        _ => Value::Null,
    }
}

/// Dictionary keys must be strings in the flattened shape.
fn scalar_to_key(v: Value) -> String {
    match v {
        Value::String(s) => s,
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Parse a UFix64/Fix64 decimal string into a BigDecimal.
pub fn parse_decimal(s: &str) -> Option<bigdecimal::BigDecimal> {
    use std::str::FromStr;
    bigdecimal::BigDecimal::from_str(s.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deposit_payload() -> Value {
        json!({
            "type": "Event",
            "value": {
                "id": "A.1654653399040a61.FlowToken.TokensDeposited",
                "fields": [
                    {"name": "amount", "value": {"type": "UFix64", "value": "5.00000000"}},
                    {"name": "to", "value": {"type": "Optional", "value":
                        {"type": "Address", "value": "0x1E3C78C6D580273B"}}}
                ]
            }
        })
    }

    #[test]
    fn test_flatten_event() {
        let flat = flatten_strict(&deposit_payload()).unwrap();
        assert_eq!(flat["amount"], json!("5.00000000"));
        assert_eq!(flat["to"], json!("1e3c78c6d580273b"));
    }

    #[test]
    fn test_empty_optional_is_null() {
        let node = json!({"type": "Optional", "value": null});
        assert_eq!(flatten_strict(&node).unwrap(), Value::Null);
    }

    #[test]
    fn test_big_integers_stay_strings() {
        let node = json!({"type": "UInt256", "value": "115792089237316195423570985008687907853269984665640564039457584007913129639935"});
        let flat = flatten_strict(&node).unwrap();
        assert!(flat.as_str().unwrap().starts_with("11579"));
    }

    #[test]
    fn test_byte_arrays_stay_arrays() {
        let node = json!({"type": "Array", "value": [
            {"type": "UInt8", "value": "143"},
            {"type": "UInt8", "value": "104"},
            {"type": "UInt8", "value": "105"}
        ]});
        let flat = flatten_strict(&node).unwrap();
        assert_eq!(flat, json!(["143", "104", "105"]));
    }

    #[test]
    fn test_strict_rejects_unknown_type() {
        let node = json!({"type": "Mystery", "value": 1});
        assert!(flatten_strict(&node).is_err());
    }

    #[test]
    fn test_lossy_matches_strict_on_good_input() {
        let payload = deposit_payload();
        let strict = flatten_strict(&payload).unwrap();
        let lossy = extract_lossy(&payload);
        assert_eq!(strict, lossy);
    }

    #[test]
    fn test_lossy_degrades_unknown_to_null() {
        let node = json!({
            "type": "Event",
            "value": {"id": "A.1.B.C", "fields": [
                {"name": "weird", "value": {"type": "Mystery", "value": 1}}
            ]}
        });
        let lossy = extract_lossy(&node);
        assert_eq!(lossy["weird"], Value::Null);
    }

    #[test]
    fn test_decode_safe_base64_roundtrip() {
        let raw = serde_json::to_vec(&deposit_payload()).unwrap();
        let b64 = base64::encode(&raw);
        let (ty, flat) = decode_event_payload_safe(b64.as_bytes());
        assert_eq!(
            ty.as_deref(),
            Some("A.1654653399040a61.FlowToken.TokensDeposited")
        );
        assert_eq!(flat["amount"], json!("5.00000000"));
    }

    #[test]
    fn test_parse_decimal() {
        let d = parse_decimal("5.00000000").unwrap();
        assert_eq!(d, parse_decimal("5").unwrap());
        assert!(parse_decimal("not a number").is_none());
    }

    #[test]
    fn test_dictionary_flattening() {
        let node = json!({"type": "Dictionary", "value": [
            {"key": {"type": "String", "value": "name"},
             "value": {"type": "String", "value": "Flovatar"}}
        ]});
        let flat = flatten_strict(&node).unwrap();
        assert_eq!(flat["name"], json!("Flovatar"));
    }
}
