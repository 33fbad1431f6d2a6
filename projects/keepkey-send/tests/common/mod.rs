#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::bip32::DerivationPath;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::{absolute::LockTime, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use keepkey_send::broadcast::{BroadcastNetwork, BroadcastResponse};
use keepkey_send::chains::bitcoin::validate_destination;
use keepkey_send::signing::{AuthorityError, AuthorityRequest, AuthorityResponse, FailureCode, SigningAuthority};
use keepkey_send::sources::{RawTransactionSource, StaticFeeOracle, XpubChangeDeriver};
use keepkey_send::{
    ExtendedKey, FeeRates, KeyRegistry, Result, ScriptType, SendConfig, SendError, SendPlanner, UnsignedTransaction,
    Utxo, UtxoSource,
};

pub const BTC_CAIP: &str = "bip122:000000000019d6689c085ae165831e93/slip44:0";
pub const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";
pub const ZPUB: &str = "zpub6jftahH18ngZxUuv6oSniLNrBCSSE1B4EEU59bwTCEt8x6aS6b2mdfLxbS4QS53g85SWWP6wexqeer516433gYpZQoJie2tcMYdJ1SYYYAL";
pub const DEST: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
pub const CORRECT_PIN: &str = "1234";

/// Version 1 legacy transaction paying 50_000 and 120_000 sats
pub const LEGACY_PREV_TX: &str = "0100000001abababababababababababababababababababababababababababababababab0000000000ffffffff0250c30000000000001976a914111111111111111111111111111111111111111188acc0d40100000000001976a914222222222222222222222222222222222222222288ac00000000";
pub const LEGACY_PREV_TXID: &str = "2acaa881f516f15dc8c7f5fd1b889ddb770624873c53b1281ff1da3adeb546f3";

/// Not derived from any test key
pub const FOREIGN_ADDRESS: &str = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";

pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn native_utxo(seed: u8, value: u64, confirmations: u32) -> Utxo {
    Utxo {
        txid: Txid::from_byte_array([seed; 32]),
        vout: 0,
        value,
        confirmations,
        xpub: ZPUB.to_string(),
        script_type: ScriptType::NativeSegwit,
        path: DerivationPath::from_str(&format!("m/84'/0'/0'/0/{}", seed)).unwrap(),
        address: None,
        prev_tx_hex: None,
    }
}

/// Output 1 of `LEGACY_PREV_TX`, without the previous transaction attached
pub fn legacy_utxo() -> Utxo {
    Utxo {
        txid: Txid::from_str(LEGACY_PREV_TXID).unwrap(),
        vout: 1,
        value: 120_000,
        confirmations: 50,
        xpub: XPUB.to_string(),
        script_type: ScriptType::Legacy,
        path: DerivationPath::from_str("m/44'/0'/0'/0/0").unwrap(),
        address: None,
        prev_tx_hex: None,
    }
}

pub fn registry(xpubs: &[&str]) -> KeyRegistry {
    let mut registry = KeyRegistry::new();
    for xpub in xpubs {
        registry.register(ExtendedKey::parse(BTC_CAIP, xpub, None).expect("valid test key"));
    }
    registry
}

pub fn flat_rates(rate: u64) -> FeeRates {
    FeeRates {
        slow: rate,
        medium: rate,
        fast: rate,
    }
}

pub fn planner(xpubs: &[&str], utxos: Vec<Utxo>, rates: FeeRates) -> SendPlanner {
    SendPlanner::new(
        registry(xpubs),
        Arc::new(MockUtxoSource::new(utxos)),
        Arc::new(StaticFeeOracle(rates)),
        Arc::new(XpubChangeDeriver::new()),
        SendConfig::default(),
    )
}

/// Hands out the fixed UTXO list, grouped by owning key
pub struct MockUtxoSource {
    utxos: Vec<Utxo>,
    pub calls: Mutex<Vec<String>>,
}

impl MockUtxoSource {
    pub fn new(utxos: Vec<Utxo>) -> Self {
        Self {
            utxos,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl UtxoSource for MockUtxoSource {
    async fn list_unspent(&self, key: &ExtendedKey) -> Result<Vec<Utxo>> {
        self.calls.lock().unwrap().push(key.xpub().to_string());
        Ok(self.utxos.iter().filter(|u| u.xpub == key.xpub()).cloned().collect())
    }
}

#[derive(Default)]
pub struct MockRawTransactions {
    pub transactions: HashMap<Txid, Vec<u8>>,
}

impl MockRawTransactions {
    pub fn with_legacy_prev_tx() -> Self {
        let mut transactions = HashMap::new();
        transactions.insert(
            Txid::from_str(LEGACY_PREV_TXID).unwrap(),
            hex::decode(LEGACY_PREV_TX).unwrap(),
        );
        Self { transactions }
    }
}

#[async_trait]
impl RawTransactionSource for MockRawTransactions {
    async fn raw_transaction(&self, txid: &Txid) -> Result<Vec<u8>> {
        self.transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| SendError::UtxoSource(format!("unknown transaction {}", txid)))
    }
}

/// What the mock device does once asked to confirm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    Approve,
    Reject,
    /// Never answers, like a device left on the confirmation screen
    Hang,
}

#[derive(Default)]
struct DeviceState {
    unsigned: Option<UnsignedTransaction>,
    pin_ok: bool,
    passphrase_ok: bool,
    calls: Vec<String>,
    pins_tried: Vec<String>,
    cancels: usize,
}

/// Scripted KeepKey: optional PIN and passphrase, then button confirmation
pub struct MockAuthority {
    pin: Option<String>,
    passphrase: bool,
    confirm: Confirm,
    unreachable: bool,
    /// Pays change here instead of the derived change address
    change_to: Option<String>,
    state: Mutex<DeviceState>,
}

impl MockAuthority {
    pub fn new(confirm: Confirm) -> Self {
        Self {
            pin: None,
            passphrase: false,
            confirm,
            unreachable: false,
            change_to: None,
            state: Mutex::new(DeviceState::default()),
        }
    }

    pub fn with_pin(mut self, pin: &str) -> Self {
        self.pin = Some(pin.to_string());
        self
    }

    pub fn with_passphrase(mut self) -> Self {
        self.passphrase = true;
        self
    }

    pub fn redirecting_change(address: &str) -> Self {
        Self {
            change_to: Some(address.to_string()),
            ..Self::new(Confirm::Approve)
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::new(Confirm::Approve)
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn pins_tried(&self) -> Vec<String> {
        self.state.lock().unwrap().pins_tried.clone()
    }

    pub fn cancels(&self) -> usize {
        self.state.lock().unwrap().cancels
    }

    fn after_unlock(&self, state: &DeviceState) -> AuthorityResponse {
        if self.pin.is_some() && !state.pin_ok {
            AuthorityResponse::PinMatrixRequest
        } else if self.passphrase && !state.passphrase_ok {
            AuthorityResponse::PassphraseRequest
        } else {
            AuthorityResponse::ButtonRequest
        }
    }
}

#[async_trait]
impl SigningAuthority for MockAuthority {
    async fn call(&self, request: AuthorityRequest) -> std::result::Result<AuthorityResponse, AuthorityError> {
        if self.unreachable {
            return Err(AuthorityError("device disconnected".to_string()));
        }

        let signed = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(request.name().to_string());
            match request {
                AuthorityRequest::SignTx { tx, .. } => {
                    state.unsigned = Some(tx);
                    return Ok(self.after_unlock(&state));
                }
                AuthorityRequest::PinMatrixAck { pin } => {
                    state.pins_tried.push(pin.clone());
                    if self.pin.as_deref() != Some(pin.as_str()) {
                        return Ok(AuthorityResponse::Failure {
                            code: FailureCode::PinInvalid,
                            message: "Invalid PIN".to_string(),
                        });
                    }
                    state.pin_ok = true;
                    return Ok(self.after_unlock(&state));
                }
                AuthorityRequest::PassphraseAck { .. } => {
                    state.passphrase_ok = true;
                    return Ok(self.after_unlock(&state));
                }
                AuthorityRequest::ButtonAck => match self.confirm {
                    Confirm::Approve => state
                        .unsigned
                        .as_ref()
                        .map(|unsigned| sign_paying_change(unsigned, self.change_to.as_deref())),
                    Confirm::Reject => {
                        return Ok(AuthorityResponse::Failure {
                            code: FailureCode::ActionCancelled,
                            message: "Signing cancelled".to_string(),
                        })
                    }
                    Confirm::Hang => None,
                },
            }
        };

        match signed {
            Some(serialized_tx) => Ok(AuthorityResponse::TxSigned { serialized_tx }),
            None => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn cancel(&self) -> std::result::Result<(), AuthorityError> {
        self.state.lock().unwrap().cancels += 1;
        Ok(())
    }
}

/// Serialize a transaction matching `unsigned` the way the device would
pub fn sign(unsigned: &UnsignedTransaction) -> Vec<u8> {
    sign_paying_change(unsigned, None)
}

fn sign_paying_change(unsigned: &UnsignedTransaction, change_to: Option<&str>) -> Vec<u8> {
    let script_for = |address: &str| {
        validate_destination(address, unsigned.network)
            .expect("test address is valid")
            .script_pubkey()
    };
    let tx = Transaction {
        version: unsigned.version as i32,
        lock_time: LockTime::ZERO,
        input: unsigned
            .inputs
            .iter()
            .map(|input| TxIn {
                previous_output: OutPoint {
                    txid: input.prev_txid,
                    vout: input.prev_index,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: unsigned
            .outputs
            .iter()
            .map(|output| TxOut {
                value: output.amount,
                script_pubkey: match (&output.address, change_to, &output.change_address) {
                    (Some(address), _, _) => script_for(address),
                    (None, Some(foreign), _) => script_for(foreign),
                    (None, None, Some(change)) => script_for(change),
                    (None, None, None) => ScriptBuf::new(),
                },
            })
            .collect(),
    };
    serialize(&tx)
}

/// Mempool stand-in: accepts once, then reports "already known"
#[derive(Default)]
pub struct MockNetwork {
    pub seen: Mutex<HashSet<String>>,
    pub reject_with: Option<String>,
    pub report_txid: Option<String>,
    pub offline: bool,
}

impl MockNetwork {
    pub fn rejecting(message: &str) -> Self {
        Self {
            reject_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn submissions(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl BroadcastNetwork for MockNetwork {
    async fn broadcast(&self, raw_hex: &str) -> Result<BroadcastResponse> {
        if self.offline {
            return Err(SendError::NetworkUnavailable("connection refused".to_string()));
        }
        if let Some(message) = &self.reject_with {
            return Ok(BroadcastResponse::Rejected {
                message: message.clone(),
            });
        }
        if !self.seen.lock().unwrap().insert(raw_hex.to_string()) {
            return Ok(BroadcastResponse::Rejected {
                message: "txn-already-known".to_string(),
            });
        }
        let tx: Transaction = deserialize(&hex::decode(raw_hex).unwrap()).unwrap();
        let txid = self.report_txid.clone().unwrap_or_else(|| tx.txid().to_string());
        Ok(BroadcastResponse::Accepted { txid })
    }
}
