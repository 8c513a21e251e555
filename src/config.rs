//! Global configuration
//!
//! A process-wide `Config` loaded once from `flowblox.toml`, with every
//! recognized option also overridable through its environment variable
//! (the env name wins). Accessors below are the single source of truth
//! for defaults.

pub use config::Config;
pub use once_cell::sync::OnceCell;
use std::error::Error;

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

pub fn init_global_config(path: &str) -> Result<(), Box<dyn Error>> {
    let config = Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .build()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| "Config already set")?;
    Ok(())
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Seed an empty global config so accessors fall back to defaults.
#[cfg(test)]
pub fn init_empty_for_tests() {
    let _ = GLOBAL_CONFIG.set(Config::default());
}

/// Load a config file directly, bypassing the global (tests, tools).
pub fn load_config(path: &str) -> Result<Config, Box<dyn Error>> {
    Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .build()
        .map_err(|e| Box::new(e) as Box<dyn Error>)
}

fn env_or_config_string(env_name: &str, config_key: &str, default: &str) -> String {
    if let Ok(v) = std::env::var(env_name) {
        if !v.is_empty() {
            return v;
        }
    }
    get_global_config()
        .get_string(config_key)
        .unwrap_or_else(|_| default.to_string())
}

fn env_or_config_u64(env_name: &str, config_key: &str, default: u64) -> u64 {
    if let Ok(v) = std::env::var(env_name) {
        if let Ok(n) = v.parse() {
            return n;
        }
    }
    get_global_config()
        .get_int(config_key)
        .map(|n| n as u64)
        .unwrap_or(default)
}

fn env_or_config_bool(env_name: &str, config_key: &str, default: bool) -> bool {
    if let Ok(v) = std::env::var(env_name) {
        match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => return true,
            "0" | "false" | "no" => return false,
            _ => {}
        }
    }
    get_global_config().get_bool(config_key).unwrap_or(default)
}

/// Access node endpoints, comma separated in env or a list in the file.
pub fn access_nodes() -> Vec<String> {
    if let Ok(v) = std::env::var("FLOW_ACCESS_NODES") {
        return v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    get_global_config()
        .get_array("flow.access_nodes")
        .map(|arr| {
            arr.into_iter()
                .filter_map(|v| v.into_string().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Serialize heavy per-block payloads (guarantees/seals/signatures).
pub fn store_block_payloads() -> bool {
    env_or_config_bool("STORE_BLOCK_PAYLOADS", "indexer.store_block_payloads", false)
}

/// Fetch contract source on AccountContract events.
pub fn store_contract_code() -> bool {
    env_or_config_bool("STORE_CONTRACT_CODE", "indexer.store_contract_code", true)
}

/// Cap on the contract-code backfill crawl per range.
pub fn contract_code_backfill_per_range() -> u64 {
    env_or_config_u64(
        "CONTRACT_CODE_BACKFILL_PER_RANGE",
        "indexer.contract_code_backfill_per_range",
        10,
    )
}

/// Per-block per-transaction RPC fan-out bound.
pub fn tx_fetch_concurrency() -> usize {
    env_or_config_u64("FLOW_TX_FETCH_CONCURRENCY", "flow.tx_fetch_concurrency", 24) as usize
}

/// Per-processor timeout inside the live deriver, milliseconds.
pub fn live_processor_timeout_ms() -> u64 {
    env_or_config_u64(
        "LIVE_DERIVER_PROCESSOR_TIMEOUT_MS",
        "live_deriver.processor_timeout_ms",
        120_000,
    )
}

pub fn repair_concurrency() -> usize {
    env_or_config_u64("REPAIR_CONCURRENCY", "live_deriver.repair_concurrency", 4) as usize
}

pub fn repair_batch() -> u64 {
    env_or_config_u64("REPAIR_BATCH", "live_deriver.repair_batch", 2000)
}

/// Keep fee-vault transfers in the token transfer table.
pub fn include_fee_transfers() -> bool {
    env_or_config_bool("INCLUDE_FEE_TRANSFERS", "tokens.include_fee_transfers", false)
}

/// FlowFees vault address; mainnet default, testnet must override.
pub fn flow_fees_address() -> String {
    crate::address::normalize_flow_address(&env_or_config_string(
        "FLOW_FEES_ADDRESS",
        "flow.fees_address",
        "f919ee77447b7497",
    ))
}

/// Custodial addresses excluded from NFT ownership attribution.
pub fn nft_custodial_addresses() -> Vec<String> {
    let raw = env_or_config_string(
        "NFT_CUSTODIAL_ADDRESSES",
        "tokens.nft_custodial_addresses",
        "",
    );
    let mut set: Vec<String> = DEFAULT_NFT_CUSTODIAL
        .iter()
        .map(|s| s.to_string())
        .collect();
    for part in raw.split(',') {
        let addr = crate::address::normalize_flow_address(part);
        if !addr.is_empty() && !set.contains(&addr) {
            set.push(addr);
        }
    }
    set
}

/// Built-in custodial set (marketplace escrow vaults).
const DEFAULT_NFT_CUSTODIAL: &[&str] = &["20187093790b9aef", "4eb8a10cb9f87357"];

/// First height where the modern (post-1.0) Cadence wire format and the
/// typed bulk results RPC are reliable. Below it, only the raw JSON-CDC
/// path is attempted.
pub fn modern_cadence_floor() -> u64 {
    env_or_config_u64(
        "FLOW_MODERN_CADENCE_FLOOR",
        "flow.modern_cadence_floor",
        85_981_135,
    )
}

pub fn token_metadata_new_per_range() -> u64 {
    env_or_config_u64(
        "TOKEN_METADATA_NEW_PER_RANGE",
        "token_metadata.new_per_range",
        20,
    )
}

pub fn token_metadata_ft_backfill_per_range() -> u64 {
    env_or_config_u64(
        "TOKEN_METADATA_FT_BACKFILL_PER_RANGE",
        "token_metadata.ft_backfill_per_range",
        10,
    )
}

pub fn token_metadata_nft_backfill_per_range() -> u64 {
    env_or_config_u64(
        "TOKEN_METADATA_NFT_BACKFILL_PER_RANGE",
        "token_metadata.nft_backfill_per_range",
        10,
    )
}

pub fn token_metadata_script_timeout_ms() -> u64 {
    env_or_config_u64(
        "TOKEN_METADATA_SCRIPT_TIMEOUT_MS",
        "token_metadata.script_timeout_ms",
        15_000,
    )
}

pub fn nft_reconciler_pairs_per_cycle() -> u64 {
    env_or_config_u64(
        "NFT_RECONCILER_PAIRS_PER_CYCLE",
        "reconciler.pairs_per_cycle",
        50,
    )
}

pub fn nft_reconciler_verify_batch() -> u64 {
    env_or_config_u64("NFT_RECONCILER_VERIFY_BATCH", "reconciler.verify_batch", 100)
}

pub fn nft_reconciler_script_timeout_ms() -> u64 {
    env_or_config_u64(
        "NFT_RECONCILER_SCRIPT_TIMEOUT_MS",
        "reconciler.script_timeout_ms",
        30_000,
    )
}

// Cadence service contract addresses, parameterized per network.
// Defaults are mainnet.

pub fn view_resolver_address() -> String {
    env_or_config_string(
        "FLOW_VIEW_RESOLVER_ADDRESS",
        "flow.view_resolver_address",
        "1d7e57aa55817448",
    )
}

pub fn metadata_views_address() -> String {
    env_or_config_string(
        "FLOW_METADATA_VIEWS_ADDRESS",
        "flow.metadata_views_address",
        "1d7e57aa55817448",
    )
}

pub fn non_fungible_token_address() -> String {
    env_or_config_string(
        "FLOW_NON_FUNGIBLE_TOKEN_ADDRESS",
        "flow.non_fungible_token_address",
        "1d7e57aa55817448",
    )
}

pub fn fungible_token_address() -> String {
    env_or_config_string(
        "FLOW_FUNGIBLE_TOKEN_ADDRESS",
        "flow.fungible_token_address",
        "f233dcee88fe0abe",
    )
}

pub fn fungible_token_metadata_views_address() -> String {
    env_or_config_string(
        "FLOW_FUNGIBLE_TOKEN_METADATA_VIEWS_ADDRESS",
        "flow.fungible_token_metadata_views_address",
        "f233dcee88fe0abe",
    )
}

pub fn evm_bridge_config_address() -> String {
    env_or_config_string(
        "FLOW_EVM_BRIDGE_CONFIG_ADDRESS",
        "flow.evm_bridge_config_address",
        "1e4aa0b87d10b141",
    )
}

pub fn staking_address() -> String {
    env_or_config_string("FLOW_STAKING_ADDRESS", "flow.staking_address", "8624b52f9ddcd04a")
}
