//! External data collaborators: UTXOs, fee rates, previous transactions and change addresses
//!
//! Implementations live outside this crate (indexer clients, the device
//! itself); the send pipeline only depends on these traits.

use async_trait::async_trait;
use bitcoin::bip32::DerivationPath;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::chains::bitcoin::address::{derive_change_address, ChangeAddress};
use crate::chains::ScriptType;
use crate::errors::Result;
use crate::registry::ExtendedKey;
use crate::signing::lock;

/// A spendable output owned by one of the registered keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
    pub confirmations: u32,
    /// Owning account key
    pub xpub: String,
    pub script_type: ScriptType,
    /// Full path of the receiving address
    pub path: DerivationPath,
    #[serde(default)]
    pub address: Option<String>,
    /// Raw previous transaction, when the indexer supplies it
    #[serde(default)]
    pub prev_tx_hex: Option<String>,
}

impl Utxo {
    pub fn outpoint(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }
}

/// Fee tier chosen by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeTier {
    Slow,
    #[default]
    Medium,
    Fast,
}

/// Tiered fee estimates in sat/vB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRates {
    pub slow: u64,
    pub medium: u64,
    pub fast: u64,
}

impl FeeRates {
    pub fn rate_for(&self, tier: FeeTier) -> u64 {
        match tier {
            FeeTier::Slow => self.slow,
            FeeTier::Medium => self.medium,
            FeeTier::Fast => self.fast,
        }
    }
}

#[async_trait]
pub trait UtxoSource: Send + Sync {
    async fn list_unspent(&self, key: &ExtendedKey) -> Result<Vec<Utxo>>;
}

#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn get_fee_rates(&self, caip: &str) -> Result<FeeRates>;
}

/// Supplies raw previous transactions for legacy inputs
#[async_trait]
pub trait RawTransactionSource: Send + Sync {
    async fn raw_transaction(&self, txid: &Txid) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait ChangeAddressDeriver: Send + Sync {
    async fn next_change_address(&self, key: &ExtendedKey) -> Result<ChangeAddress>;
}

/// Derives change addresses locally from the account xpub.
///
/// The next unused change index per key is supplied by the caller (usually
/// from the indexer's used-address count); keys without one start at 0.
#[derive(Debug, Default)]
pub struct XpubChangeDeriver {
    next_index: Mutex<HashMap<String, u32>>,
}

impl XpubChangeDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(self, xpub: &str, index: u32) -> Self {
        self.set_next_index(xpub, index);
        self
    }

    pub fn set_next_index(&self, xpub: &str, index: u32) {
        lock(&self.next_index).insert(xpub.to_string(), index);
    }
}

#[async_trait]
impl ChangeAddressDeriver for XpubChangeDeriver {
    async fn next_change_address(&self, key: &ExtendedKey) -> Result<ChangeAddress> {
        let index = lock(&self.next_index).get(key.xpub()).copied().unwrap_or(0);
        derive_change_address(key, index)
    }
}

/// Fixed fee rates, for offline planning and tests
#[derive(Debug, Clone, Copy)]
pub struct StaticFeeOracle(pub FeeRates);

#[async_trait]
impl FeeOracle for StaticFeeOracle {
    async fn get_fee_rates(&self, _caip: &str) -> Result<FeeRates> {
        Ok(self.0)
    }
}
