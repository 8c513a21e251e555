//! Token transfer builder
//!
//! Classifies raw events into FT/NFT withdraw/deposit legs, pairs legs
//! within one transaction into transfer rows, and derives the
//! address-transaction and contract-registry rows that ride along.
//!
//! Both event generations are understood: the legacy per-token events
//! (`A.<addr>.<Token>.TokensDeposited`, `<NFT>.Deposit`) and the
//! post-1.0 standard events (`FungibleToken.Deposited`,
//! `NonFungibleToken.Withdrawn`) whose token contract lives in the
//! payload `type` field rather than the event type.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

use crate::address::normalize_flow_address;
use crate::config;
use crate::error::BoxError;
use crate::processor::{Processor, ProcessorContext, TOKEN_WORKER};
use crate::types::{
    AddressTransactionRow, ContractRegistryRow, Event, TokenTransfer, TransferKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegDirection {
    Withdraw,
    Deposit,
}

/// One classified withdraw/deposit event, before pairing.
#[derive(Debug, Clone)]
pub struct TransferLeg {
    direction: LegDirection,
    /// Mint for `TokensMinted`, Burn for `TokensBurned`; pairing fills
    /// in Transfer for everything matched.
    kind_hint: Option<TransferKind>,
    contract_id: String,
    contract_address: String,
    contract_name: String,
    is_nft: bool,
    /// from-address on withdrawals, to-address on deposits.
    counterparty: String,
    amount: String,
    nft_id: String,
    uuid: String,
    event_index: u32,
    transaction_id: String,
    block_height: u64,
    timestamp: DateTime<Utc>,
}

/// Classify one raw event into a transfer leg, or None when it is not
/// a token movement. FlowToken mint/burn noise (fee machinery on every
/// block) is excluded here.
pub fn classify_leg(event: &Event) -> Option<TransferLeg> {
    let event_type = event.event_type.as_str();

    let (direction, is_nft, kind_hint) = if event_type.contains("FungibleToken.Deposited") {
        (LegDirection::Deposit, false, None)
    } else if event_type.contains("FungibleToken.Withdrawn") {
        (LegDirection::Withdraw, false, None)
    } else if event_type.contains("NonFungibleToken.Deposited") {
        (LegDirection::Deposit, true, None)
    } else if event_type.contains("NonFungibleToken.Withdrawn") {
        (LegDirection::Withdraw, true, None)
    } else if event_type.ends_with(".TokensDeposited") {
        (LegDirection::Deposit, false, None)
    } else if event_type.ends_with(".TokensWithdrawn") {
        (LegDirection::Withdraw, false, None)
    } else if event_type.ends_with(".TokensMinted") {
        if event.contract_name() == "FlowToken" {
            return None;
        }
        (LegDirection::Deposit, false, Some(TransferKind::Mint))
    } else if event_type.ends_with(".TokensBurned") {
        if event.contract_name() == "FlowToken" {
            return None;
        }
        (LegDirection::Withdraw, false, Some(TransferKind::Burn))
    } else if event_type.ends_with(".Deposit") {
        (LegDirection::Deposit, true, None)
    } else if event_type.ends_with(".Withdraw") {
        (LegDirection::Withdraw, true, None)
    } else {
        return None;
    };

    let (contract_id, contract_address, contract_name) = resolve_token_contract(event);
    if contract_id.is_empty() {
        return None;
    }

    let counterparty_key = match direction {
        LegDirection::Withdraw => "from",
        LegDirection::Deposit => "to",
    };
    let counterparty = event
        .payload_str(counterparty_key)
        .map(|s| normalize_flow_address(&s))
        .unwrap_or_default();

    Some(TransferLeg {
        direction,
        kind_hint,
        contract_id,
        contract_address,
        contract_name,
        is_nft,
        counterparty,
        amount: event.payload_str("amount").unwrap_or_default(),
        nft_id: event.payload_str("id").unwrap_or_default(),
        uuid: extract_uuid(event),
        event_index: event.event_index,
        transaction_id: event.transaction_id.clone(),
        block_height: event.block_height,
        timestamp: event.timestamp,
    })
}

/// The standard-contract events describe the token in the payload
/// `type` field (`A.<addr>.<Name>.Vault` / `.NFT`); per-token events
/// are the token contract themselves.
fn resolve_token_contract(event: &Event) -> (String, String, String) {
    let own_name = event.contract_name();
    if own_name == "FungibleToken" || own_name == "NonFungibleToken" {
        if let Some(type_id) = event.payload_str("type") {
            let parts: Vec<&str> = type_id.split('.').collect();
            if parts.len() >= 3 && parts[0] == "A" {
                let addr = normalize_flow_address(parts[1]);
                let name = parts[2].to_string();
                if !addr.is_empty() && !name.is_empty() {
                    return (format!("A.{}.{}", addr, name), addr, name);
                }
            }
        }
    }
    (
        event.contract_id(),
        event.contract_address(),
        own_name.to_string(),
    )
}

fn extract_uuid(event: &Event) -> String {
    for key in ["uuid", "withdrawnUUID", "depositedUUID", "vaultUUID"] {
        if let Some(v) = event.payload_str(key) {
            if !v.is_empty() {
                return v;
            }
        }
    }
    String::new()
}

type PairKey = (String, bool, String);

fn pair_key(leg: &TransferLeg) -> PairKey {
    let discriminator = if !leg.uuid.is_empty() {
        leg.uuid.clone()
    } else if leg.is_nft {
        leg.nft_id.clone()
    } else {
        leg.amount.clone()
    };
    (leg.contract_id.clone(), leg.is_nft, discriminator)
}

/// Pair legs of one transaction, in event-index order, into transfer
/// rows. Pure: identical input yields identical output. Unmatched
/// deposits become mints, unmatched withdrawals become burns, each
/// with an empty counterpart address.
pub fn build_token_transfers(mut legs: Vec<TransferLeg>) -> Vec<TokenTransfer> {
    legs.sort_by_key(|l| l.event_index);

    let mut pending: HashMap<PairKey, VecDeque<TransferLeg>> = HashMap::new();
    let mut out: Vec<TokenTransfer> = Vec::new();

    for leg in legs {
        match leg.direction {
            LegDirection::Withdraw => {
                pending.entry(pair_key(&leg)).or_default().push_back(leg);
            }
            LegDirection::Deposit => {
                let matched = pending
                    .get_mut(&pair_key(&leg))
                    .and_then(|queue| queue.pop_front());
                match matched {
                    Some(withdraw) => out.push(transfer_row(
                        &leg,
                        withdraw.counterparty.clone(),
                        leg.counterparty.clone(),
                        TransferKind::Transfer,
                    )),
                    None => out.push(transfer_row(
                        &leg,
                        String::new(),
                        leg.counterparty.clone(),
                        leg.kind_hint.unwrap_or(TransferKind::Mint),
                    )),
                }
            }
        }
    }

    let mut leftovers: Vec<TransferLeg> = pending.into_values().flatten().collect();
    leftovers.sort_by_key(|l| l.event_index);
    for withdraw in leftovers {
        out.push(transfer_row(
            &withdraw,
            withdraw.counterparty.clone(),
            String::new(),
            withdraw.kind_hint.unwrap_or(TransferKind::Burn),
        ));
    }

    out.sort_by_key(|t| t.event_index);
    out
}

fn transfer_row(
    primary: &TransferLeg,
    from_address: String,
    to_address: String,
    kind: TransferKind,
) -> TokenTransfer {
    TokenTransfer {
        transaction_id: primary.transaction_id.clone(),
        event_index: primary.event_index,
        block_height: primary.block_height,
        timestamp: primary.timestamp,
        contract_id: primary.contract_id.clone(),
        contract_address: primary.contract_address.clone(),
        contract_name: primary.contract_name.clone(),
        from_address,
        to_address,
        amount: primary.amount.clone(),
        nft_id: primary.nft_id.clone(),
        is_nft: primary.is_nft,
        kind,
    }
}

pub struct TokenTransferProcessor {
    ctx: ProcessorContext,
}

impl TokenTransferProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Processor for TokenTransferProcessor {
    fn name(&self) -> &'static str {
        TOKEN_WORKER
    }

    async fn process_range(
        &self,
        from: u64,
        to: u64,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let repo = &self.ctx.repository;
        repo.ensure_app_partitions(from, to).await?;

        let events = repo.get_raw_events_in_range(from, to).await?;
        if events.is_empty() {
            return Ok(());
        }

        // Group per transaction, preserving first-seen order.
        let mut tx_order: Vec<String> = Vec::new();
        let mut by_tx: HashMap<String, Vec<TransferLeg>> = HashMap::new();
        for event in &events {
            if let Some(leg) = classify_leg(event) {
                if !by_tx.contains_key(&leg.transaction_id) {
                    tx_order.push(leg.transaction_id.clone());
                }
                by_tx.entry(leg.transaction_id.clone()).or_default().push(leg);
            }
        }

        let fees_address = config::flow_fees_address();
        let include_fees = config::include_fee_transfers();

        let mut ft_rows: Vec<TokenTransfer> = Vec::new();
        let mut nft_rows: Vec<TokenTransfer> = Vec::new();
        for tx_id in &tx_order {
            let legs = by_tx.remove(tx_id).unwrap_or_default();
            for transfer in build_token_transfers(legs) {
                if !include_fees
                    && !fees_address.is_empty()
                    && (transfer.from_address == fees_address
                        || transfer.to_address == fees_address)
                {
                    continue;
                }
                if transfer.is_nft {
                    nft_rows.push(transfer);
                } else if valid_amount(&transfer.amount) {
                    ft_rows.push(transfer);
                }
            }
        }

        let address_rows = address_transaction_rows(&ft_rows, &nft_rows);
        let registry_rows = registry_rows(&ft_rows, &nft_rows);

        if !ft_rows.is_empty() {
            repo.upsert_ft_transfers(&ft_rows).await?;
        }
        if !nft_rows.is_empty() {
            repo.upsert_nft_transfers(&nft_rows).await?;
        }
        if !address_rows.is_empty() {
            repo.upsert_address_transactions(&address_rows).await?;
        }
        if !registry_rows.is_empty() {
            repo.upsert_contract_registry(&registry_rows).await?;
        }
        Ok(())
    }
}

fn valid_amount(amount: &str) -> bool {
    BigDecimal::from_str(amount).is_ok()
}

fn address_transaction_rows(
    ft: &[TokenTransfer],
    nft: &[TokenTransfer],
) -> Vec<AddressTransactionRow> {
    let mut rows = Vec::new();
    for transfer in ft.iter().chain(nft) {
        if !transfer.from_address.is_empty() {
            rows.push(AddressTransactionRow {
                address: transfer.from_address.clone(),
                transaction_id: transfer.transaction_id.clone(),
                block_height: transfer.block_height,
                role: "sender".to_string(),
                timestamp: transfer.timestamp,
            });
        }
        if !transfer.to_address.is_empty() {
            rows.push(AddressTransactionRow {
                address: transfer.to_address.clone(),
                transaction_id: transfer.transaction_id.clone(),
                block_height: transfer.block_height,
                role: "receiver".to_string(),
                timestamp: transfer.timestamp,
            });
        }
    }
    rows
}

fn registry_rows(ft: &[TokenTransfer], nft: &[TokenTransfer]) -> Vec<ContractRegistryRow> {
    let mut first_seen: HashMap<String, ContractRegistryRow> = HashMap::new();
    for transfer in ft.iter().chain(nft) {
        first_seen
            .entry(transfer.contract_id.clone())
            .and_modify(|row| {
                row.first_seen_height = row.first_seen_height.min(transfer.block_height)
            })
            .or_insert_with(|| ContractRegistryRow {
                contract_id: transfer.contract_id.clone(),
                contract_address: transfer.contract_address.clone(),
                contract_name: transfer.contract_name.clone(),
                is_nft: transfer.is_nft,
                first_seen_height: transfer.block_height,
            });
    }
    let mut rows: Vec<ContractRegistryRow> = first_seen.into_values().collect();
    rows.sort_by(|a, b| a.contract_id.cmp(&b.contract_id));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PinnedPool;
    use crate::testutil::{test_timestamp, tx_id_for, MemoryRepository};
    use serde_json::json;
    use std::sync::Arc;

    fn event(
        tx: u64,
        event_index: u32,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Event {
        Event {
            transaction_id: tx_id_for(tx),
            transaction_index: 0,
            event_index,
            event_type: event_type.to_string(),
            block_height: 100,
            timestamp: test_timestamp(),
            payload,
        }
    }

    fn withdraw(tx: u64, idx: u32, from: &str, amount: &str, uuid: &str) -> Event {
        event(
            tx,
            idx,
            "A.0f9df91c9121c460.BloctoToken.TokensWithdrawn",
            json!({"amount": amount, "from": from, "uuid": uuid}),
        )
    }

    fn deposit(tx: u64, idx: u32, to: &str, amount: &str, uuid: &str) -> Event {
        event(
            tx,
            idx,
            "A.0f9df91c9121c460.BloctoToken.TokensDeposited",
            json!({"amount": amount, "to": to, "uuid": uuid}),
        )
    }

    fn legs_of(events: &[Event]) -> Vec<TransferLeg> {
        events.iter().filter_map(classify_leg).collect()
    }

    #[test]
    fn test_pairing_by_uuid() {
        // S4: one withdraw + one deposit with matching uuid.
        let events = vec![
            withdraw(1, 0, "0x0a", "5.00000000", "42"),
            deposit(1, 1, "0x0b", "5.00000000", "42"),
        ];
        let transfers = build_token_transfers(legs_of(&events));
        assert_eq!(transfers.len(), 1);
        let t = &transfers[0];
        assert_eq!(t.from_address, "000000000000000a");
        assert_eq!(t.to_address, "000000000000000b");
        assert_eq!(t.amount, "5.00000000");
        assert_eq!(t.kind, TransferKind::Transfer);
    }

    #[test]
    fn test_unpaired_deposit_is_mint() {
        let transfers = build_token_transfers(legs_of(&[deposit(1, 0, "0x0b", "1.0", "")]));
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].kind, TransferKind::Mint);
        assert_eq!(transfers[0].from_address, "");
    }

    #[test]
    fn test_unpaired_withdraw_is_burn() {
        let transfers = build_token_transfers(legs_of(&[withdraw(1, 0, "0x0a", "1.0", "")]));
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].kind, TransferKind::Burn);
        assert_eq!(transfers[0].to_address, "");
    }

    #[test]
    fn test_pairing_is_deterministic() {
        let events = vec![
            withdraw(1, 0, "0x0a", "5.0", ""),
            withdraw(1, 1, "0x0c", "7.0", ""),
            deposit(1, 2, "0x0b", "5.0", ""),
            deposit(1, 3, "0x0d", "9.0", ""),
        ];
        let first = build_token_transfers(legs_of(&events));
        let second = build_token_transfers(legs_of(&events));
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        // 5.0 pairs, 7.0 burns, 9.0 mints.
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_flow_token_mint_burn_excluded() {
        let ev = event(
            1,
            0,
            "A.1654653399040a61.FlowToken.TokensMinted",
            json!({"amount": "0.001"}),
        );
        assert!(classify_leg(&ev).is_none());

        let ev = event(
            1,
            0,
            "A.0f9df91c9121c460.BloctoToken.TokensMinted",
            json!({"amount": "10.0"}),
        );
        let leg = classify_leg(&ev).unwrap();
        assert_eq!(leg.kind_hint, Some(TransferKind::Mint));
    }

    #[test]
    fn test_standard_event_contract_from_payload_type() {
        let ev = event(
            1,
            0,
            "A.f233dcee88fe0abe.FungibleToken.Deposited",
            json!({
                "type": "A.1654653399040a61.FlowToken.Vault",
                "amount": "2.50000000",
                "to": "0x1e3c78c6d580273b"
            }),
        );
        let leg = classify_leg(&ev).unwrap();
        assert_eq!(leg.contract_id, "A.1654653399040a61.FlowToken");
        assert_eq!(leg.contract_name, "FlowToken");
        assert!(!leg.is_nft);
    }

    #[test]
    fn test_nft_pairing_by_id() {
        let events = vec![
            event(
                1,
                0,
                "A.0b2a3299cc857e29.TopShot.Withdraw",
                json!({"id": "1337", "from": "0x0a"}),
            ),
            event(
                1,
                1,
                "A.0b2a3299cc857e29.TopShot.Deposit",
                json!({"id": "1337", "to": "0x0b"}),
            ),
        ];
        let transfers = build_token_transfers(legs_of(&events));
        assert_eq!(transfers.len(), 1);
        assert!(transfers[0].is_nft);
        assert_eq!(transfers[0].nft_id, "1337");
        assert_eq!(transfers[0].from_address, "000000000000000a");
        assert_eq!(transfers[0].to_address, "000000000000000b");
    }

    #[tokio::test]
    async fn test_process_range_is_idempotent() {
        crate::config::init_empty_for_tests();
        let repo = Arc::new(MemoryRepository::new());
        repo.seed_events(vec![
            withdraw(1, 0, "0x0a", "5.0", "42"),
            deposit(1, 1, "0x0b", "5.0", "42"),
        ]);
        let ctx = ProcessorContext::new(
            Arc::clone(&repo) as Arc<dyn crate::repository::Repository>,
            Arc::new(PinnedPool::new(vec![])),
        );
        let processor = TokenTransferProcessor::new(ctx);
        let cancel = CancellationToken::new();

        processor.process_range(100, 101, &cancel).await.unwrap();
        let first = repo.ft_transfers();
        processor.process_range(100, 101, &cancel).await.unwrap();
        let second = repo.ft_transfers();

        assert_eq!(first.len(), 1);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        // Address-transaction and registry rows ride along.
        assert_eq!(repo.address_transactions().len(), 2);
        assert_eq!(repo.contract_registry().len(), 1);
    }

    #[tokio::test]
    async fn test_fee_vault_transfers_filtered() {
        crate::config::init_empty_for_tests();
        let repo = Arc::new(MemoryRepository::new());
        repo.seed_events(vec![
            withdraw(1, 0, "0x1e3c78c6d580273b", "0.00001", "9"),
            deposit(1, 1, "0xf919ee77447b7497", "0.00001", "9"),
        ]);
        let ctx = ProcessorContext::new(
            Arc::clone(&repo) as Arc<dyn crate::repository::Repository>,
            Arc::new(PinnedPool::new(vec![])),
        );
        let processor = TokenTransferProcessor::new(ctx);
        processor
            .process_range(100, 101, &CancellationToken::new())
            .await
            .unwrap();
        assert!(repo.ft_transfers().is_empty());
    }
}
