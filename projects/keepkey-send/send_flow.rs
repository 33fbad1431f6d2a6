//! Review → sign → broadcast pipeline for a single UTXO send
//!
//! [`SendPlanner`] gathers fresh UTXOs and fee rates and produces a
//! [`SendPlan`]: the selection the user reviews and the unsigned transaction
//! the device will sign. [`SendFlow`] adds the signing session and broadcast.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use bitcoin::Txid;

use crate::broadcast::{BroadcastReceipt, Broadcaster};
use crate::chains::bitcoin::address::ChangeAddress;
use crate::chains::bitcoin::{assemble, validate_destination, FinishedTransaction, UnsignedTransaction};
use crate::chains::ScriptType;
use crate::coin_select::{CoinSelector, Destination, SelectionRequest, SelectionResult, SendAmount};
use crate::config::SendConfig;
use crate::errors::{Result, SendError};
use crate::registry::{ExtendedKey, KeyRegistry};
use crate::signing::{SigningCoordinator, SigningSessionHandle};
use crate::sources::{ChangeAddressDeriver, FeeOracle, FeeTier, RawTransactionSource, Utxo, UtxoSource};

/// How the fee rate is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum FeeChoice {
    Tier(FeeTier),
    /// Explicit sat/vB
    Rate(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub caip: String,
    pub destination: String,
    pub amount: SendAmount,
    /// Falls back to the configured default tier
    #[serde(default)]
    pub fee: Option<FeeChoice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPlan {
    pub selection: SelectionResult,
    pub unsigned: UnsignedTransaction,
    pub fee_rate: u64,
}

pub struct SendPlanner {
    registry: KeyRegistry,
    utxos: Arc<dyn UtxoSource>,
    fees: Arc<dyn FeeOracle>,
    change: Arc<dyn ChangeAddressDeriver>,
    raw_transactions: Option<Arc<dyn RawTransactionSource>>,
    config: SendConfig,
}

impl SendPlanner {
    pub fn new(
        registry: KeyRegistry,
        utxos: Arc<dyn UtxoSource>,
        fees: Arc<dyn FeeOracle>,
        change: Arc<dyn ChangeAddressDeriver>,
        config: SendConfig,
    ) -> Self {
        Self {
            registry,
            utxos,
            fees,
            change,
            raw_transactions: None,
            config,
        }
    }

    /// Source for legacy previous transactions the UTXO source did not include
    pub fn with_raw_transactions(mut self, source: Arc<dyn RawTransactionSource>) -> Self {
        self.raw_transactions = Some(source);
        self
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SendConfig {
        &self.config
    }

    pub async fn build(&self, request: &SendRequest) -> Result<SendPlan> {
        let network = self.config.network;
        let destination = validate_destination(&request.destination, network)?;

        let keys = self.spendable_keys(&request.caip);
        if keys.is_empty() {
            return Err(SendError::NoSpendableAssetFound(request.caip.clone()));
        }

        let listed = try_join_all(keys.iter().map(|key| self.utxos.list_unspent(key))).await?;
        let utxos: Vec<Utxo> = listed.into_iter().flatten().collect();
        log::info!("🔍 Found {} UTXOs across {} keys for {}", utxos.len(), keys.len(), request.caip);

        let fee_rate = self.fee_rate(request).await?;

        let change = match request.amount {
            SendAmount::Exact(_) => {
                let key = self.change_key(&keys);
                Some(self.change.next_change_address(key).await?)
            }
            SendAmount::Drain => None,
        };

        let selector = CoinSelector::new(self.config.dust_threshold, self.config.min_confirmations);
        let mut selection = selector.select(
            &utxos,
            &SelectionRequest {
                caip: &request.caip,
                destination: Destination::from_address(&destination),
                amount: request.amount,
                sat_per_vbyte: fee_rate,
                change: change.as_ref(),
            },
        )?;

        self.hydrate_previous_transactions(&mut selection).await?;

        let unsigned = assemble(
            &selection,
            &self.registry,
            network,
            self.config.tx_version,
            self.config.lock_time,
        )?;
        Ok(SendPlan {
            selection,
            unsigned,
            fee_rate,
        })
    }

    fn spendable_keys(&self, caip: &str) -> Vec<&ExtendedKey> {
        self.registry
            .keys_for_asset(caip)
            .into_iter()
            .filter(|key| {
                let matches = key.network() == self.config.network;
                if !matches {
                    log::warn!("Skipping {} key for {}: wrong network", key.script_type(), caip);
                }
                matches
            })
            .collect()
    }

    async fn fee_rate(&self, request: &SendRequest) -> Result<u64> {
        let rate = match request.fee.unwrap_or(FeeChoice::Tier(self.config.default_fee_tier)) {
            FeeChoice::Rate(rate) => rate,
            FeeChoice::Tier(tier) => {
                let rates = self.fees.get_fee_rates(&request.caip).await?;
                log::info!("💸 Fee rates slow/medium/fast: {}/{}/{} sat/vB", rates.slow, rates.medium, rates.fast);
                rates.rate_for(tier)
            }
        };
        if rate == 0 {
            return Err(SendError::InvalidAmount("fee rate must be at least 1 sat/vB".to_string()));
        }
        Ok(rate)
    }

    /// Configured change type if a key of that type exists, else native segwit, else the first key
    fn change_key<'k>(&self, keys: &[&'k ExtendedKey]) -> &'k ExtendedKey {
        let by_type = |script_type: ScriptType| keys.iter().copied().find(|k| k.script_type() == script_type);
        self.config
            .change_script_type
            .and_then(by_type)
            .or_else(|| by_type(ScriptType::NativeSegwit))
            .unwrap_or(keys[0])
    }

    async fn hydrate_previous_transactions(&self, selection: &mut SelectionResult) -> Result<()> {
        let missing: Vec<usize> = selection
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, u)| u.script_type.requires_previous_transaction() && u.prev_tx_hex.is_none())
            .map(|(index, _)| index)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let Some(source) = &self.raw_transactions else {
            // The assembler reports which input is missing its previous transaction
            return Ok(());
        };

        log::info!("📥 Fetching {} previous transactions for legacy inputs", missing.len());
        let txids: Vec<Txid> = missing.iter().map(|index| selection.inputs[*index].txid).collect();
        let fetched = try_join_all(txids.iter().map(|txid| source.raw_transaction(txid))).await?;
        for (index, raw) in missing.into_iter().zip(fetched) {
            selection.inputs[index].prev_tx_hex = Some(hex::encode(raw));
        }
        Ok(())
    }
}

/// Planner, coordinator and broadcaster for one connected device
pub struct SendFlow {
    planner: SendPlanner,
    coordinator: SigningCoordinator,
    broadcaster: Broadcaster,
}

impl SendFlow {
    pub fn new(planner: SendPlanner, coordinator: SigningCoordinator, broadcaster: Broadcaster) -> Self {
        Self {
            planner,
            coordinator,
            broadcaster,
        }
    }

    pub fn planner(&self) -> &SendPlanner {
        &self.planner
    }

    pub fn coordinator(&self) -> &SigningCoordinator {
        &self.coordinator
    }

    pub async fn build(&self, request: &SendRequest) -> Result<SendPlan> {
        self.planner.build(request).await
    }

    /// Start signing the reviewed plan on the device
    pub fn sign(&self, plan: &SendPlan) -> Result<SigningSessionHandle> {
        self.coordinator.start(plan.unsigned.clone())
    }

    pub async fn broadcast(&self, signed: &FinishedTransaction) -> Result<BroadcastReceipt> {
        self.broadcaster.broadcast(signed).await
    }
}

/// Summary of a change destination for display
pub fn describe_change(change: &ChangeAddress) -> String {
    format!("{} ({}, {})", change.address, change.script_type, change.path)
}
