//! Bitcoin unsigned transaction assembly
//!
//! Turns a coin selection into the payload the device signs. Inputs carry
//! the signing path and script type of their owning key; legacy inputs also
//! carry the full previous transaction, segwit inputs only the spent amount.

use bitcoin::bip32::DerivationPath;
use bitcoin::consensus::encode::deserialize;
use bitcoin::{Network, Transaction, Txid};
use serde::{Deserialize, Serialize};

use super::ScriptType;
use crate::coin_select::SelectionResult;
use crate::errors::{Result, SendError};
use crate::registry::KeyRegistry;
use crate::sources::Utxo;

/// Bitcoin transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BitcoinTxInput {
    /// Previous transaction hash
    pub prev_txid: Txid,
    /// Previous output index
    pub prev_index: u32,
    /// Derivation path
    pub address_n: DerivationPath,
    /// Input amount in satoshis
    pub amount: u64,
    /// Script type
    pub script_type: ScriptType,
    /// Full previous transaction (legacy inputs only)
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_hex")]
    pub prev_tx: Option<Vec<u8>>,
}

/// Bitcoin transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BitcoinTxOutput {
    /// Recipient address (if external)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Derivation path (if change)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_n: Option<DerivationPath>,
    /// Output amount in satoshis
    pub amount: u64,
    /// Script type (if change)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_type: Option<ScriptType>,
    /// Address derived locally from `address_n`; the signed output must pay it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_address: Option<String>,
    pub is_change: bool,
}

/// The payload handed to the signing device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransaction {
    pub network: Network,
    pub inputs: Vec<BitcoinTxInput>,
    pub outputs: Vec<BitcoinTxOutput>,
    pub version: u32,
    pub lock_time: u32,
}

impl UnsignedTransaction {
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|i| i.amount).sum()
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    pub fn fee(&self) -> u64 {
        self.input_total().saturating_sub(self.output_total())
    }
}

/// Build the unsigned transaction for `selection`.
///
/// Output order is kept exactly as selected: the device shows outputs in this
/// order for the user to confirm.
pub fn assemble(
    selection: &SelectionResult,
    registry: &KeyRegistry,
    network: Network,
    version: u32,
    lock_time: u32,
) -> Result<UnsignedTransaction> {
    let inputs = selection
        .inputs
        .iter()
        .map(|utxo| assemble_input(utxo, registry))
        .collect::<Result<Vec<_>>>()?;

    let mut outputs = Vec::with_capacity(selection.outputs.len());
    for output in &selection.outputs {
        if output.is_change {
            let change = selection
                .change
                .as_ref()
                .filter(|c| c.address == output.address)
                .ok_or_else(|| SendError::UnknownKey(format!("change output {}", output.address)))?;
            if registry.get(&change.xpub).is_none() {
                return Err(SendError::UnknownKey(change.xpub.clone()));
            }
            outputs.push(BitcoinTxOutput {
                address: None,
                address_n: Some(change.path.clone()),
                amount: output.amount,
                script_type: Some(change.script_type),
                change_address: Some(change.address.clone()),
                is_change: true,
            });
        } else {
            outputs.push(BitcoinTxOutput {
                address: Some(output.address.clone()),
                address_n: None,
                amount: output.amount,
                script_type: None,
                change_address: None,
                is_change: false,
            });
        }
    }

    let unsigned = UnsignedTransaction {
        network,
        inputs,
        outputs,
        version,
        lock_time,
    };
    log::info!(
        "🧾 Assembled unsigned transaction: {} inputs, {} outputs, fee {} sats",
        unsigned.inputs.len(),
        unsigned.outputs.len(),
        unsigned.fee()
    );
    Ok(unsigned)
}

fn assemble_input(utxo: &Utxo, registry: &KeyRegistry) -> Result<BitcoinTxInput> {
    let key = registry
        .get(&utxo.xpub)
        .ok_or_else(|| SendError::UnknownKey(format!("owner of {}", utxo.outpoint())))?;

    if key.script_type() != utxo.script_type {
        return Err(SendError::UtxoKeyMismatch {
            outpoint: utxo.outpoint(),
            reason: format!("UTXO is {} but its key is {}", utxo.script_type, key.script_type()),
        });
    }
    if !key.owns_path(&utxo.path) {
        return Err(SendError::UtxoKeyMismatch {
            outpoint: utxo.outpoint(),
            reason: format!("path {} is not below account {}", utxo.path, key.path()),
        });
    }

    let prev_tx = match key.script_type() {
        ScriptType::Legacy => Some(previous_transaction(utxo)?),
        ScriptType::WrappedSegwit | ScriptType::NativeSegwit => None,
    };

    Ok(BitcoinTxInput {
        prev_txid: utxo.txid,
        prev_index: utxo.vout,
        address_n: utxo.path.clone(),
        amount: utxo.value,
        script_type: key.script_type(),
        prev_tx,
    })
}

/// Decode and check the previous transaction a legacy input spends
fn previous_transaction(utxo: &Utxo) -> Result<Vec<u8>> {
    let raw_hex = utxo
        .prev_tx_hex
        .as_deref()
        .ok_or_else(|| SendError::MissingPreviousTransaction { outpoint: utxo.outpoint() })?;
    let mismatch = |reason: String| SendError::PreviousTransactionMismatch {
        outpoint: utxo.outpoint(),
        reason,
    };

    let bytes = hex::decode(raw_hex.trim()).map_err(|e| mismatch(format!("invalid hex: {}", e)))?;
    let tx: Transaction = deserialize(&bytes).map_err(|e| mismatch(format!("undecodable: {}", e)))?;

    if tx.txid() != utxo.txid {
        return Err(mismatch(format!("hashes to {}", tx.txid())));
    }
    let spent = tx
        .output
        .get(utxo.vout as usize)
        .ok_or_else(|| mismatch(format!("has no output {}", utxo.vout)))?;
    if spent.value != utxo.value {
        return Err(mismatch(format!("output value {} != {}", spent.value, utxo.value)));
    }
    Ok(bytes)
}

/// A fully signed transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedTransaction {
    raw_hex: String,
    txid: Txid,
}

impl FinishedTransaction {
    /// Decode a serialized transaction returned by the device
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let tx: Transaction = deserialize(raw).map_err(|e| {
            SendError::UnexpectedAuthorityState(format!("device returned an undecodable transaction: {}", e))
        })?;
        Ok(Self {
            raw_hex: hex::encode(raw),
            txid: tx.txid(),
        })
    }

    pub fn raw_hex(&self) -> &str {
        &self.raw_hex
    }

    pub fn txid(&self) -> Txid {
        self.txid
    }

    pub fn transaction(&self) -> Result<Transaction> {
        let bytes = hex::decode(&self.raw_hex)
            .map_err(|e| SendError::UnexpectedAuthorityState(format!("invalid raw hex: {}", e)))?;
        deserialize(&bytes).map_err(|e| SendError::UnexpectedAuthorityState(e.to_string()))
    }

    /// Check the signed transaction spends and pays exactly what was sent for signing
    pub fn verify_against(&self, unsigned: &UnsignedTransaction) -> Result<()> {
        let tx = self.transaction()?;
        let mismatch = |what: String| SendError::UnexpectedAuthorityState(format!("signed transaction {}", what));

        if tx.input.len() != unsigned.inputs.len() || tx.output.len() != unsigned.outputs.len() {
            return Err(mismatch(format!(
                "has {} inputs / {} outputs, expected {} / {}",
                tx.input.len(),
                tx.output.len(),
                unsigned.inputs.len(),
                unsigned.outputs.len()
            )));
        }

        for (index, (txin, input)) in tx.input.iter().zip(&unsigned.inputs).enumerate() {
            if txin.previous_output.txid != input.prev_txid || txin.previous_output.vout != input.prev_index {
                return Err(mismatch(format!("input {} spends {}", index, txin.previous_output)));
            }
        }

        for (index, (txout, output)) in tx.output.iter().zip(&unsigned.outputs).enumerate() {
            if txout.value != output.amount {
                return Err(mismatch(format!("output {} pays {} instead of {}", index, txout.value, output.amount)));
            }
            let address = match (&output.address, &output.change_address) {
                (Some(address), _) => address,
                (None, Some(change)) => change,
                (None, None) => return Err(mismatch(format!("output {} has no address to check against", index))),
            };
            let expected = super::address::validate_destination(address, unsigned.network)?.script_pubkey();
            if txout.script_pubkey != expected {
                return Err(mismatch(format!("output {} pays a different script", index)));
            }
        }
        Ok(())
    }
}

mod opt_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
pub(crate) mod test_vectors {
    /// Version 1 legacy transaction with outputs of 50_000 and 120_000 sats
    pub const LEGACY_PREV_TX: &str = "0100000001abababababababababababababababababababababababababababababababab0000000000ffffffff0250c30000000000001976a914111111111111111111111111111111111111111188acc0d40100000000001976a914222222222222222222222222222222222222222288ac00000000";
    pub const LEGACY_PREV_TXID: &str = "2acaa881f516f15dc8c7f5fd1b889ddb770624873c53b1281ff1da3adeb546f3";
}
