//! Coin selection for UTXO sends
//!
//! Two distinct paths:
//! - exact amount: accumulate inputs in deterministic order until amount plus
//!   fee (with a change output) is covered, then decide whether change is worth
//!   creating
//! - drain: spend every spendable output into a single destination output,
//!   never creating change
//!
//! All arithmetic is integer satoshis.

use serde::{Deserialize, Serialize};

use crate::chains::bitcoin::address::ChangeAddress;
use crate::chains::bitcoin::{estimate_weight, fee_for_weight};
use crate::chains::ScriptType;
use crate::errors::{Result, SendError};
use crate::sources::Utxo;

/// What the user asked to send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode", content = "amount")]
pub enum SendAmount {
    Exact(u64),
    Drain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedOutput {
    pub address: String,
    pub amount: u64,
    pub is_change: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionResult {
    pub inputs: Vec<Utxo>,
    pub outputs: Vec<SelectedOutput>,
    pub fee: u64,
    /// Excess below the dust threshold added to the fee instead of a change output
    pub folded_dust: u64,
    /// Change destination, present only when a change output exists
    pub change: Option<ChangeAddress>,
}

impl SelectionResult {
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|u| u.value).sum()
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    pub fn change_output(&self) -> Option<&SelectedOutput> {
        self.outputs.iter().find(|o| o.is_change)
    }
}

/// Destination of a selection: address text plus its scriptPubKey length
#[derive(Debug, Clone)]
pub struct Destination {
    pub address: String,
    pub script_len: usize,
}

impl Destination {
    pub fn from_address(address: &bitcoin::Address) -> Self {
        Self {
            address: address.to_string(),
            script_len: address.script_pubkey().len(),
        }
    }
}

/// Everything a single selection needs
#[derive(Debug, Clone)]
pub struct SelectionRequest<'a> {
    pub caip: &'a str,
    pub destination: Destination,
    pub amount: SendAmount,
    pub sat_per_vbyte: u64,
    /// Required for exact sends, ignored when draining
    pub change: Option<&'a ChangeAddress>,
}

#[derive(Debug, Clone)]
pub struct CoinSelector {
    dust_threshold: u64,
    min_confirmations: u32,
}

impl CoinSelector {
    pub fn new(dust_threshold: u64, min_confirmations: u32) -> Self {
        Self {
            dust_threshold,
            min_confirmations,
        }
    }

    pub fn dust_threshold(&self) -> u64 {
        self.dust_threshold
    }

    pub fn select(&self, utxos: &[Utxo], request: &SelectionRequest<'_>) -> Result<SelectionResult> {
        if utxos.is_empty() {
            return Err(SendError::NoSpendableAssetFound(request.caip.to_string()));
        }
        if request.sat_per_vbyte == 0 {
            return Err(SendError::InvalidAmount("fee rate must be at least 1 sat/vB".to_string()));
        }

        let spendable = self.order_spendable(utxos);
        log::info!(
            "🪙 Selecting from {} of {} UTXOs at {} sat/vB",
            spendable.len(),
            utxos.len(),
            request.sat_per_vbyte
        );

        let result = match request.amount {
            SendAmount::Exact(amount) => {
                let change = request.change.ok_or_else(|| {
                    SendError::InvalidAmount("exact sends need a change address".to_string())
                })?;
                self.select_exact(spendable, amount, request, change)?
            }
            SendAmount::Drain => self.select_drain(spendable, request)?,
        };

        debug_assert_eq!(result.input_total(), result.output_total() + result.fee);
        log::info!(
            "✅ Selected {} inputs, {} outputs, fee {} sats",
            result.inputs.len(),
            result.outputs.len(),
            result.fee
        );
        Ok(result)
    }

    /// Most-confirmed first, then smallest value, then outpoint
    fn order_spendable(&self, utxos: &[Utxo]) -> Vec<Utxo> {
        let mut spendable: Vec<Utxo> = utxos
            .iter()
            .filter(|u| u.confirmations >= self.min_confirmations)
            .cloned()
            .collect();
        spendable.sort_by(|a, b| {
            b.confirmations
                .cmp(&a.confirmations)
                .then(a.value.cmp(&b.value))
                .then(a.txid.cmp(&b.txid))
                .then(a.vout.cmp(&b.vout))
        });
        spendable
    }

    fn select_exact(
        &self,
        spendable: Vec<Utxo>,
        amount: u64,
        request: &SelectionRequest<'_>,
        change: &ChangeAddress,
    ) -> Result<SelectionResult> {
        if amount <= self.dust_threshold {
            return Err(SendError::InvalidAmount(format!(
                "{} sats is at or below the dust threshold of {} sats",
                amount, self.dust_threshold
            )));
        }

        let rate = request.sat_per_vbyte;
        let with_change = [request.destination.script_len, change.script_type.script_pubkey_len()];
        let without_change = [request.destination.script_len];

        let mut chosen: Vec<Utxo> = Vec::new();
        let mut total: u64 = 0;
        let mut fee_with_change = 0;
        let mut covered = false;

        for utxo in spendable {
            total = add_value(total, &utxo)?;
            chosen.push(utxo);
            fee_with_change = fee_for(&chosen, &with_change, rate)?;
            if total >= amount.saturating_add(fee_with_change) {
                covered = true;
                break;
            }
        }

        if !covered {
            log::warn!(
                "Insufficient funds: {} sats available for {} + {} fee",
                total,
                amount,
                fee_with_change
            );
            return Err(SendError::InsufficientFunds {
                needed: amount.saturating_add(fee_with_change),
                available: total,
            });
        }

        let excess = total - amount - fee_with_change;
        let destination = SelectedOutput {
            address: request.destination.address.clone(),
            amount,
            is_change: false,
        };

        if excess > self.dust_threshold {
            let change_output = SelectedOutput {
                address: change.address.clone(),
                amount: excess,
                is_change: true,
            };
            return Ok(SelectionResult {
                inputs: chosen,
                outputs: vec![destination, change_output],
                fee: fee_with_change,
                folded_dust: 0,
                change: Some(change.clone()),
            });
        }

        // Change would be dust: drop it and let the excess go to the miner
        let fee_without_change = fee_for(&chosen, &without_change, rate)?;
        let fee = total - amount;
        let folded_dust = fee - fee_without_change.min(fee);
        log::info!(
            "💨 Change of {} sats is below dust threshold {}; folding {} sats into the fee",
            excess,
            self.dust_threshold,
            folded_dust
        );

        Ok(SelectionResult {
            inputs: chosen,
            outputs: vec![destination],
            fee,
            folded_dust,
            change: None,
        })
    }

    fn select_drain(&self, spendable: Vec<Utxo>, request: &SelectionRequest<'_>) -> Result<SelectionResult> {
        let total = spendable.iter().try_fold(0u64, add_value)?;
        let fee = fee_for(&spendable, &[request.destination.script_len], request.sat_per_vbyte)?;

        // The lone output must clear the dust threshold after fees
        let minimum = fee.saturating_add(self.dust_threshold).saturating_add(1);
        if spendable.is_empty() || total < minimum {
            log::warn!("Drain impossible: {} sats available, {} sats consumed by fees", total, fee);
            return Err(SendError::InsufficientFunds {
                needed: minimum,
                available: total,
            });
        }

        Ok(SelectionResult {
            outputs: vec![SelectedOutput {
                address: request.destination.address.clone(),
                amount: total - fee,
                is_change: false,
            }],
            inputs: spendable,
            fee,
            folded_dust: 0,
            change: None,
        })
    }
}

fn fee_for(inputs: &[Utxo], output_script_lens: &[usize], sat_per_vbyte: u64) -> Result<u64> {
    let weight = estimate_weight(inputs.iter().map(|u| u.script_type), output_script_lens);
    fee_for_weight(weight, sat_per_vbyte).ok_or_else(|| {
        SendError::InvalidAmount(format!("fee rate of {} sat/vB overflows the fee", sat_per_vbyte))
    })
}

fn add_value(total: u64, utxo: &Utxo) -> Result<u64> {
    total
        .checked_add(utxo.value)
        .ok_or_else(|| SendError::UtxoSource(format!("UTXO values overflow at {}", utxo.outpoint())))
}

/// Input script types present in a selection, deduplicated
pub fn input_script_types(result: &SelectionResult) -> Vec<ScriptType> {
    let mut types: Vec<ScriptType> = result.inputs.iter().map(|u| u.script_type).collect();
    types.sort();
    types.dedup();
    types
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::bip32::DerivationPath;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;
    use std::str::FromStr;

    const CAIP: &str = "bip122:000000000019d6689c085ae165831e93/slip44:0";
    const DEST: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

    fn utxo(seed: u8, value: u64, confirmations: u32, script_type: ScriptType) -> Utxo {
        let purpose = script_type.purpose();
        Utxo {
            txid: Txid::from_byte_array([seed; 32]),
            vout: 0,
            value,
            confirmations,
            xpub: format!("key-{}", purpose),
            script_type,
            path: DerivationPath::from_str(&format!("m/{}'/0'/0'/0/{}", purpose, seed)).unwrap(),
            address: None,
            prev_tx_hex: None,
        }
    }

    fn change() -> ChangeAddress {
        ChangeAddress {
            address: "bc1qchange".to_string(),
            path: DerivationPath::from_str("m/84'/0'/0'/1/0").unwrap(),
            script_type: ScriptType::NativeSegwit,
            xpub: "key-84".to_string(),
        }
    }

    fn request<'a>(amount: SendAmount, rate: u64, change: &'a ChangeAddress) -> SelectionRequest<'a> {
        SelectionRequest {
            caip: CAIP,
            destination: Destination {
                address: DEST.to_string(),
                script_len: 22,
            },
            amount,
            sat_per_vbyte: rate,
            change: Some(change),
        }
    }

    fn assert_conserved(result: &SelectionResult) {
        assert_eq!(result.input_total(), result.output_total() + result.fee);
    }

    #[test]
    fn test_exact_send_with_change() {
        let selector = CoinSelector::new(546, 0);
        let change = change();
        let utxos = vec![utxo(1, 100_000, 3, ScriptType::NativeSegwit)];

        let result = selector
            .select(&utxos, &request(SendAmount::Exact(30_000), 10, &change))
            .unwrap();

        assert_eq!(result.inputs.len(), 1);
        assert_eq!(result.outputs.len(), 2);
        assert_eq!(result.fee, 1_410);
        assert_eq!(result.outputs[0], SelectedOutput { address: DEST.to_string(), amount: 30_000, is_change: false });
        assert_eq!(result.outputs[1].amount, 68_590);
        assert!(result.outputs[1].is_change);
        assert_eq!(result.change, Some(change));
        assert_conserved(&result);
    }

    #[test]
    fn test_drain_spends_everything_without_change() {
        let selector = CoinSelector::new(546, 0);
        let change = change();
        let utxos = vec![utxo(1, 100_000, 3, ScriptType::NativeSegwit)];

        let result = selector.select(&utxos, &request(SendAmount::Drain, 10, &change)).unwrap();

        assert_eq!(result.inputs.len(), 1);
        assert_eq!(result.outputs.len(), 1);
        assert_eq!(result.fee, 1_100);
        assert_eq!(result.outputs[0].amount, 98_900);
        assert!(!result.outputs[0].is_change);
        assert!(result.change.is_none());
        assert_conserved(&result);
    }

    #[test]
    fn test_insufficient_funds() {
        let selector = CoinSelector::new(546, 0);
        let change = change();
        let utxos = vec![
            utxo(1, 20_000, 3, ScriptType::NativeSegwit),
            utxo(2, 30_000, 3, ScriptType::NativeSegwit),
        ];

        let err = selector
            .select(&utxos, &request(SendAmount::Exact(60_000), 10, &change))
            .unwrap_err();
        match err {
            SendError::InsufficientFunds { available, needed } => {
                assert_eq!(available, 50_000);
                assert!(needed > 60_000);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_funds_consumed_by_fees() {
        let selector = CoinSelector::new(546, 0);
        let change = change();
        let utxos = vec![utxo(1, 1_500, 3, ScriptType::Legacy)];

        let err = selector.select(&utxos, &request(SendAmount::Drain, 10, &change)).unwrap_err();
        assert_eq!(err.kind(), "insufficient_funds");

        // Balance covers the amount but not the fee
        let utxos = vec![utxo(1, 30_500, 3, ScriptType::NativeSegwit)];
        let err = selector
            .select(&utxos, &request(SendAmount::Exact(30_000), 10, &change))
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_funds");
    }

    #[test]
    fn test_no_utxos_at_all() {
        let selector = CoinSelector::new(546, 0);
        let change = change();
        let err = selector.select(&[], &request(SendAmount::Drain, 10, &change)).unwrap_err();
        assert_eq!(err, SendError::NoSpendableAssetFound(CAIP.to_string()));
    }

    #[test]
    fn test_dust_change_is_folded_into_fee() {
        let selector = CoinSelector::new(546, 0);
        let change = change();
        // 30_000 + 1_410 fee leaves 300 sats of change
        let utxos = vec![utxo(1, 31_710, 3, ScriptType::NativeSegwit)];

        let result = selector
            .select(&utxos, &request(SendAmount::Exact(30_000), 10, &change))
            .unwrap();

        assert_eq!(result.outputs.len(), 1);
        assert!(result.change.is_none());
        assert_eq!(result.fee, 1_710);
        // One-output fee is 1_100; the rest was folded
        assert_eq!(result.folded_dust, 610);
        assert_conserved(&result);
    }

    #[test]
    fn test_deterministic_order_prefers_confirmed_then_small() {
        let selector = CoinSelector::new(546, 0);
        let change = change();
        let utxos = vec![
            utxo(1, 90_000, 1, ScriptType::NativeSegwit),
            utxo(2, 40_000, 10, ScriptType::NativeSegwit),
            utxo(3, 20_000, 10, ScriptType::NativeSegwit),
        ];

        let result = selector
            .select(&utxos, &request(SendAmount::Exact(50_000), 5, &change))
            .unwrap();

        let values: Vec<u64> = result.inputs.iter().map(|u| u.value).collect();
        assert_eq!(values, vec![20_000, 40_000]);
        assert_conserved(&result);

        let again = selector
            .select(&utxos, &request(SendAmount::Exact(50_000), 5, &change))
            .unwrap();
        assert_eq!(result, again);
    }

    #[test]
    fn test_mixed_script_types_are_weighed_individually() {
        let selector = CoinSelector::new(546, 0);
        let change = change();
        let utxos = vec![
            utxo(1, 10_000, 5, ScriptType::Legacy),
            utxo(2, 10_000, 5, ScriptType::WrappedSegwit),
            utxo(3, 10_000, 5, ScriptType::NativeSegwit),
        ];

        let result = selector.select(&utxos, &request(SendAmount::Drain, 1, &change)).unwrap();

        // 40 + 2 + 592 + 364 + 272 + 124 = 1394 WU -> 349 vB
        assert_eq!(result.fee, 349);
        assert_eq!(result.outputs[0].amount, 30_000 - 349);
        assert_eq!(
            input_script_types(&result),
            vec![ScriptType::Legacy, ScriptType::WrappedSegwit, ScriptType::NativeSegwit]
        );
        assert_conserved(&result);
    }

    #[test]
    fn test_min_confirmations_filter() {
        let selector = CoinSelector::new(546, 1);
        let change = change();
        let utxos = vec![
            utxo(1, 100_000, 0, ScriptType::NativeSegwit),
            utxo(2, 10_000, 2, ScriptType::NativeSegwit),
        ];

        let err = selector
            .select(&utxos, &request(SendAmount::Exact(30_000), 10, &change))
            .unwrap_err();
        assert_eq!(err, SendError::InsufficientFunds { needed: 31_410, available: 10_000 });
    }

    #[test]
    fn test_dust_amount_rejected() {
        let selector = CoinSelector::new(546, 0);
        let change = change();
        let utxos = vec![utxo(1, 100_000, 3, ScriptType::NativeSegwit)];
        let err = selector
            .select(&utxos, &request(SendAmount::Exact(500), 10, &change))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_amount");
    }

    #[test]
    fn test_huge_fee_rate_is_rejected() {
        let selector = CoinSelector::new(546, 0);
        let change = change();
        let utxos = vec![utxo(1, 100_000, 3, ScriptType::NativeSegwit)];

        for amount in [SendAmount::Exact(30_000), SendAmount::Drain] {
            let err = selector
                .select(&utxos, &request(amount, u64::MAX / 100, &change))
                .unwrap_err();
            assert_eq!(err.kind(), "invalid_amount");
        }
    }

    #[test]
    fn test_overflowing_utxo_values_are_rejected() {
        let selector = CoinSelector::new(546, 0);
        let change = change();
        let utxos = vec![
            utxo(1, u64::MAX - 10, 3, ScriptType::NativeSegwit),
            utxo(2, u64::MAX - 20, 3, ScriptType::NativeSegwit),
        ];

        let err = selector.select(&utxos, &request(SendAmount::Drain, 1, &change)).unwrap_err();
        assert_eq!(err.kind(), "utxo_source");
    }

    #[test]
    fn test_conservation_across_amounts() {
        let selector = CoinSelector::new(546, 0);
        let change = change();
        let utxos = vec![
            utxo(1, 12_345, 9, ScriptType::Legacy),
            utxo(2, 67_890, 4, ScriptType::WrappedSegwit),
            utxo(3, 250_000, 1, ScriptType::NativeSegwit),
        ];

        for amount in [1_000u64, 10_000, 55_555, 120_000, 300_000] {
            for rate in [1u64, 7, 33] {
                if let Ok(result) = selector.select(&utxos, &request(SendAmount::Exact(amount), rate, &change)) {
                    assert_conserved(&result);
                    assert_eq!(result.outputs[0].amount, amount);
                }
            }
        }
    }
}
