//! Address normalization
//!
//! Flow addresses are 8 bytes (16 lowercase hex chars, left-padded);
//! EVM addresses are 20 bytes (40 chars). Event payloads carry them in
//! many shapes: bare hex, `0x`-prefixed, wrapped in decoder noise like
//! `Optional(0x1e3c...)`, or sentinel strings for absent values. All of
//! them funnel through here before touching a row.

const FLOW_ADDRESS_LEN: usize = 16;
const EVM_ADDRESS_LEN: usize = 40;

/// The Flow service/zero address in canonical form.
pub const ZERO_ADDRESS: &str = "0000000000000000";

/// Strings that mean "no address" in decoded payloads.
fn is_sentinel(s: &str) -> bool {
    matches!(s, "" | "nil" | "<nil>" | "null")
}

/// Pull the hex payload out of a raw value: the first `0x`-prefixed run
/// if present, otherwise the whole string when it is already plain hex.
fn extract_hex(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches('"');
    if let Some(idx) = trimmed.find("0x") {
        let run: String = trimmed[idx + 2..]
            .chars()
            .take_while(|c| c.is_ascii_hexdigit())
            .collect();
        if run.is_empty() {
            return None;
        }
        return Some(run.to_lowercase());
    }
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(trimmed.to_lowercase());
    }
    None
}

fn normalize_to_len(raw: &str, len: usize) -> String {
    let lowered = raw.trim().trim_matches('"').to_lowercase();
    if is_sentinel(&lowered) {
        return String::new();
    }
    let mut hex = match extract_hex(&lowered) {
        Some(h) => h,
        None => return String::new(),
    };
    if hex.len() > len {
        let trimmed = hex.trim_start_matches('0');
        // Longer than the target even without leading zeros: not an
        // address of this family, keep the bare hex unchanged so the
        // operation stays idempotent.
        if trimmed.len() > len {
            return hex;
        }
        hex = trimmed.to_string();
    }
    format!("{:0>width$}", hex, width = len)
}

/// Normalize a Flow address to 16 lowercase hex chars. Sentinels and
/// non-hex garbage normalize to the empty string.
pub fn normalize_flow_address(raw: &str) -> String {
    normalize_to_len(raw, FLOW_ADDRESS_LEN)
}

/// Normalize an EVM address to 40 lowercase hex chars.
pub fn normalize_evm_address(raw: &str) -> String {
    normalize_to_len(raw, EVM_ADDRESS_LEN)
}

/// System transactions carry the zero address as both proposer and
/// payer; user-facing callbacks skip them.
pub fn is_system_transaction(proposer: &str, payer: &str) -> bool {
    let p = normalize_flow_address(proposer);
    let y = normalize_flow_address(payer);
    (p.is_empty() || p == ZERO_ADDRESS) && (y.is_empty() || y == ZERO_ADDRESS)
}
