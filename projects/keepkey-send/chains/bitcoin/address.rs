//! Bitcoin address validation and change address derivation

use bitcoin::bip32::{ChildNumber, DerivationPath};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, Network, PublicKey};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::ScriptType;
use crate::errors::{Result, SendError};
use crate::registry::ExtendedKey;

/// Internal (change) chain index below the account key
const CHANGE_CHAIN: u32 = 1;

/// A change destination the device can re-derive from its path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAddress {
    pub address: String,
    pub path: DerivationPath,
    pub script_type: ScriptType,
    pub xpub: String,
}

/// Parse a destination address and check it belongs to `network`
pub fn validate_destination(address: &str, network: Network) -> Result<Address> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(SendError::InvalidDestination {
            address: address.to_string(),
            reason: "address is empty".to_string(),
        });
    }

    let parsed = Address::from_str(trimmed).map_err(|e| SendError::InvalidDestination {
        address: address.to_string(),
        reason: format!("Failed to parse address: {}", e),
    })?;
    parsed.require_network(network).map_err(|e| SendError::InvalidDestination {
        address: address.to_string(),
        reason: format!("Address network mismatch: {}", e),
    })
}

/// Derive the change address `<account>/1/<index>` for `key`
pub fn derive_change_address(key: &ExtendedKey, index: u32) -> Result<ChangeAddress> {
    let index = ChildNumber::from_normal_idx(index)
        .map_err(|e| SendError::InvalidExtendedKey(format!("invalid change index: {}", e)))?;
    let change_chain = ChildNumber::Normal { index: CHANGE_CHAIN };

    let secp = Secp256k1::verification_only();
    let child = key
        .public_key()
        .derive_pub(&secp, &[change_chain, index])
        .map_err(|e| SendError::InvalidExtendedKey(e.to_string()))?;
    let pubkey = PublicKey::new(child.public_key);

    let address = match key.script_type() {
        ScriptType::Legacy => Address::p2pkh(&pubkey, key.network()),
        ScriptType::WrappedSegwit => Address::p2shwpkh(&pubkey, key.network())
            .map_err(|e| SendError::InvalidExtendedKey(e.to_string()))?,
        ScriptType::NativeSegwit => Address::p2wpkh(&pubkey, key.network())
            .map_err(|e| SendError::InvalidExtendedKey(e.to_string()))?,
    };

    let path: DerivationPath = key.path().child(change_chain).child(index);
    log::debug!("Derived {} change address at {}", key.script_type(), path);

    Ok(ChangeAddress {
        address: address.to_string(),
        path,
        script_type: key.script_type(),
        xpub: key.xpub().to_string(),
    })
}
