//! Embedded Cadence scripts
//!
//! The metadata and reconciliation workers interrogate live chain
//! state through script execution. The service contract addresses
//! differ per network, so every template carries placeholders that are
//! substituted from configuration at render time.

use crate::config;

const FT_METADATA_TEMPLATE: &str = r#"
import FungibleToken from 0xFUNGIBLETOKEN
import FungibleTokenMetadataViews from 0xFTMETADATAVIEWS
import ViewResolver from 0xVIEWRESOLVER

access(all) fun main(contractAddress: Address, contractName: String): {String: String}? {
    let account = getAccount(contractAddress)
    let resolver = account.contracts.borrow<&{ViewResolver}>(name: contractName)
        ?? panic("contract does not implement ViewResolver")

    if let display = resolver.resolveContractView(
        resourceType: nil,
        viewType: Type<FungibleTokenMetadataViews.FTDisplay>()
    ) as? FungibleTokenMetadataViews.FTDisplay {
        let out: {String: String} = {
            "name": display.name,
            "symbol": display.symbol,
            "description": display.description
        }
        if let logo = display.logos.items.length > 0
            ? display.logos.items[0].file.uri()
            : nil {
            out["logoUrl"] = logo
        }
        return out
    }
    return nil
}
"#;

const NFT_COLLECTION_IDS_TEMPLATE: &str = r#"
import NonFungibleToken from 0xNONFUNGIBLETOKEN
import MetadataViews from 0xMETADATAVIEWS
import ViewResolver from 0xVIEWRESOLVER

access(all) fun main(owner: Address, contractAddress: Address, contractName: String): [UInt64] {
    let resolver = getAccount(contractAddress).contracts
        .borrow<&{ViewResolver}>(name: contractName)
    if resolver == nil {
        return []
    }
    let data = resolver!.resolveContractView(
        resourceType: nil,
        viewType: Type<MetadataViews.NFTCollectionData>()
    ) as? MetadataViews.NFTCollectionData
    if data == nil {
        return []
    }
    if let collection = getAccount(owner).capabilities
        .borrow<&{NonFungibleToken.CollectionPublic}>(data!.publicPath) {
        return collection.getIDs()
    }
    return []
}
"#;

fn substitute(template: &str) -> String {
    template
        .replace("0xFUNGIBLETOKEN", &with_prefix(&config::fungible_token_address()))
        .replace(
            "0xFTMETADATAVIEWS",
            &with_prefix(&config::fungible_token_metadata_views_address()),
        )
        .replace("0xVIEWRESOLVER", &with_prefix(&config::view_resolver_address()))
        .replace(
            "0xNONFUNGIBLETOKEN",
            &with_prefix(&config::non_fungible_token_address()),
        )
        .replace("0xMETADATAVIEWS", &with_prefix(&config::metadata_views_address()))
}

fn with_prefix(address: &str) -> String {
    let trimmed = address.trim_start_matches("0x");
    format!("0x{}", trimmed)
}

/// FT display metadata query, parameterized for this network.
pub fn ft_metadata_script() -> String {
    substitute(FT_METADATA_TEMPLATE)
}

/// Owned NFT id enumeration, parameterized for this network.
pub fn nft_collection_ids_script() -> String {
    substitute(NFT_COLLECTION_IDS_TEMPLATE)
}

/// JSON-CDC argument encoders for script calls.
pub fn address_argument(address: &str) -> serde_json::Value {
    serde_json::json!({"type": "Address", "value": with_prefix(address)})
}

pub fn string_argument(value: &str) -> serde_json::Value {
    serde_json::json!({"type": "String", "value": value})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_substitute_network_addresses() {
        crate::config::init_empty_for_tests();
        let script = ft_metadata_script();
        assert!(script.contains("import FungibleToken from 0xf233dcee88fe0abe"));
        assert!(!script.contains("0xFUNGIBLETOKEN"));

        let script = nft_collection_ids_script();
        assert!(script.contains("import NonFungibleToken from 0x1d7e57aa55817448"));
    }

    #[test]
    fn test_argument_encoding() {
        assert_eq!(
            address_argument("1e3c78c6d580273b"),
            serde_json::json!({"type": "Address", "value": "0x1e3c78c6d580273b"})
        );
        assert_eq!(
            string_argument("FlowToken"),
            serde_json::json!({"type": "String", "value": "FlowToken"})
        );
    }
}
