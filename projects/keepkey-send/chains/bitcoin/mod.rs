//! Bitcoin and UTXO chain support for KeepKey
//!
//! Provides:
//! - Script types (legacy, wrapped segwit, native segwit) and their size model
//! - Destination validation and change address derivation
//! - Unsigned transaction assembly for the device

use serde::{Deserialize, Serialize};

pub mod address;
pub mod transaction;

pub use address::{derive_change_address, validate_destination};
pub use transaction::{assemble, BitcoinTxInput, BitcoinTxOutput, FinishedTransaction, UnsignedTransaction};

/// Non-witness transaction overhead: version, input count, output count, locktime
const TX_OVERHEAD_WEIGHT: u64 = 10 * 4;
/// Segwit marker and flag bytes, witness-discounted
const SEGWIT_MARKER_WEIGHT: u64 = 2;
/// Output value plus the script length prefix
const OUTPUT_FIXED_BYTES: u64 = 8 + 1;

/// Bitcoin script types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScriptType {
    /// Pay to Public Key Hash (Legacy)
    #[serde(rename = "p2pkh")]
    Legacy,
    /// Pay to Witness Public Key Hash nested in Pay to Script Hash
    #[serde(rename = "p2sh-p2wpkh")]
    WrappedSegwit,
    /// Pay to Witness Public Key Hash (SegWit)
    #[serde(rename = "p2wpkh")]
    NativeSegwit,
}

impl ScriptType {
    /// BIP43 purpose for the standard account path
    pub fn purpose(&self) -> u32 {
        match self {
            ScriptType::Legacy => 44,
            ScriptType::WrappedSegwit => 49,
            ScriptType::NativeSegwit => 84,
        }
    }

    /// Legacy sighash commits to the whole previous transaction; segwit only to the spent amount
    pub fn requires_previous_transaction(&self) -> bool {
        match self {
            ScriptType::Legacy => true,
            ScriptType::WrappedSegwit | ScriptType::NativeSegwit => false,
        }
    }

    pub fn is_segwit(&self) -> bool {
        match self {
            ScriptType::Legacy => false,
            ScriptType::WrappedSegwit | ScriptType::NativeSegwit => true,
        }
    }

    /// Weight of one signed single-key input of this type
    pub fn input_weight(&self) -> u64 {
        match self {
            // outpoint 36 + scriptSig len 1 + scriptSig 107 + sequence 4
            ScriptType::Legacy => 148 * 4,
            // 64 base bytes (23-byte redeem push) + 108 witness bytes
            ScriptType::WrappedSegwit => 64 * 4 + 108,
            // 41 base bytes + 108 witness bytes
            ScriptType::NativeSegwit => 41 * 4 + 108,
        }
    }

    /// scriptPubKey length of an address of this type
    pub fn script_pubkey_len(&self) -> usize {
        match self {
            ScriptType::Legacy => 25,
            ScriptType::WrappedSegwit => 23,
            ScriptType::NativeSegwit => 22,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::Legacy => "p2pkh",
            ScriptType::WrappedSegwit => "p2sh-p2wpkh",
            ScriptType::NativeSegwit => "p2wpkh",
        }
    }
}

impl std::fmt::Display for ScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weight of an output paying to a script of `script_len` bytes
pub fn output_weight(script_len: usize) -> u64 {
    (OUTPUT_FIXED_BYTES + script_len as u64) * 4
}

/// Estimated weight of a transaction spending `inputs` into outputs with the given script lengths
pub fn estimate_weight<I>(inputs: I, output_script_lens: &[usize]) -> u64
where
    I: IntoIterator<Item = ScriptType>,
{
    let mut weight = TX_OVERHEAD_WEIGHT;
    let mut any_segwit = false;
    for script_type in inputs {
        any_segwit |= script_type.is_segwit();
        weight += script_type.input_weight();
    }
    if any_segwit {
        weight += SEGWIT_MARKER_WEIGHT;
    }
    weight + output_script_lens.iter().map(|len| output_weight(*len)).sum::<u64>()
}

/// Virtual size, rounded up
pub fn weight_to_vbytes(weight: u64) -> u64 {
    (weight + 3) / 4
}

/// Fee in sats for a transaction of `weight` at `sat_per_vbyte`, `None` on overflow
pub fn fee_for_weight(weight: u64, sat_per_vbyte: u64) -> Option<u64> {
    weight_to_vbytes(weight).checked_mul(sat_per_vbyte)
}
