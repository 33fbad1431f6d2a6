//! Key material registry
//!
//! Holds the account-level extended public keys fetched from the device. The
//! script type of every key comes from its SLIP-132 version prefix, never
//! from the caller.

use bitcoin::base58;
use bitcoin::bip32::{ChildNumber, DerivationPath, ExtendedPubKey};
use bitcoin::Network;

use crate::chains::ScriptType;
use crate::errors::{Result, SendError};

const XPUB_VERSION: [u8; 4] = [0x04, 0x88, 0xb2, 0x1e];
const YPUB_VERSION: [u8; 4] = [0x04, 0x9d, 0x7c, 0xb2];
const ZPUB_VERSION: [u8; 4] = [0x04, 0xb2, 0x47, 0x46];
const TPUB_VERSION: [u8; 4] = [0x04, 0x35, 0x87, 0xcf];
const UPUB_VERSION: [u8; 4] = [0x04, 0x4a, 0x52, 0x62];
const VPUB_VERSION: [u8; 4] = [0x04, 0x5f, 0x1c, 0xf6];

/// Map a version prefix to its script type and network
fn classify_version(version: [u8; 4]) -> Option<(ScriptType, Network)> {
    match version {
        XPUB_VERSION => Some((ScriptType::Legacy, Network::Bitcoin)),
        YPUB_VERSION => Some((ScriptType::WrappedSegwit, Network::Bitcoin)),
        ZPUB_VERSION => Some((ScriptType::NativeSegwit, Network::Bitcoin)),
        TPUB_VERSION => Some((ScriptType::Legacy, Network::Testnet)),
        UPUB_VERSION => Some((ScriptType::WrappedSegwit, Network::Testnet)),
        VPUB_VERSION => Some((ScriptType::NativeSegwit, Network::Testnet)),
        _ => None,
    }
}

/// An account-level extended public key
#[derive(Debug, Clone)]
pub struct ExtendedKey {
    caip: String,
    xpub: String,
    path: DerivationPath,
    script_type: ScriptType,
    network: Network,
    key: ExtendedPubKey,
}

impl ExtendedKey {
    /// Parse an xpub/ypub/zpub (or test-network equivalent).
    ///
    /// Without an explicit path the standard account-0 template for the
    /// script type is used (m/44'|49'|84'/coin'/0').
    pub fn parse(caip: &str, xpub: &str, path: Option<DerivationPath>) -> Result<Self> {
        let data = base58::decode_check(xpub)
            .map_err(|e| SendError::InvalidExtendedKey(format!("base58 decode failed: {}", e)))?;
        if data.len() != 78 {
            return Err(SendError::InvalidExtendedKey(format!(
                "expected 78 bytes, got {}",
                data.len()
            )));
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&data[..4]);
        let (script_type, network) = classify_version(version).ok_or_else(|| {
            SendError::InvalidExtendedKey(format!("unknown version prefix {}", hex::encode(version)))
        })?;

        // The bip32 decoder only understands xpub/tpub; normalize the prefix
        let mut normalized = data;
        let canonical = match network {
            Network::Bitcoin => XPUB_VERSION,
            _ => TPUB_VERSION,
        };
        normalized[..4].copy_from_slice(&canonical);
        let key = ExtendedPubKey::decode(&normalized)
            .map_err(|e| SendError::InvalidExtendedKey(e.to_string()))?;

        let standard = Self::standard_path(script_type, network, 0);
        let path = match path {
            Some(path) => {
                if path != standard {
                    log::warn!(
                        "Key {}… registered at non-standard path {} (standard for {} is {})",
                        &xpub[..xpub.len().min(12)],
                        path,
                        script_type,
                        standard
                    );
                }
                path
            }
            None => standard,
        };

        Ok(Self {
            caip: caip.to_string(),
            xpub: xpub.to_string(),
            path,
            script_type,
            network,
            key,
        })
    }

    /// Standard BIP44/49/84 account path
    pub fn standard_path(script_type: ScriptType, network: Network, account: u32) -> DerivationPath {
        let coin_type = match network {
            Network::Bitcoin => 0,
            _ => 1,
        };
        DerivationPath::from(vec![
            ChildNumber::Hardened { index: script_type.purpose() },
            ChildNumber::Hardened { index: coin_type },
            ChildNumber::Hardened { index: account },
        ])
    }

    pub fn caip(&self) -> &str {
        &self.caip
    }

    pub fn xpub(&self) -> &str {
        &self.xpub
    }

    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn public_key(&self) -> &ExtendedPubKey {
        &self.key
    }

    /// Whether `path` lies below this account
    pub fn owns_path(&self, path: &DerivationPath) -> bool {
        let account: &[ChildNumber] = self.path.as_ref();
        let full: &[ChildNumber] = path.as_ref();
        full.len() > account.len() && full.starts_with(account)
    }
}

/// All keys known for the connected device
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    keys: Vec<ExtendedKey>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key; re-registering the same xpub replaces the previous record
    pub fn register(&mut self, key: ExtendedKey) {
        if let Some(existing) = self.keys.iter_mut().find(|k| k.xpub == key.xpub) {
            log::debug!("Replacing registered key for {}", key.caip);
            *existing = key;
        } else {
            log::info!("🔑 Registered {} key for {} at {}", key.script_type, key.caip, key.path);
            self.keys.push(key);
        }
    }

    pub fn get(&self, xpub: &str) -> Option<&ExtendedKey> {
        self.keys.iter().find(|k| k.xpub == xpub)
    }

    /// Keys for an asset, in registration order
    pub fn keys_for_asset(&self, caip: &str) -> Vec<&ExtendedKey> {
        self.keys.iter().filter(|k| k.caip == caip).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
