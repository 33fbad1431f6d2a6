//! Transaction broadcast
//!
//! Submits a finished transaction exactly once per call. Nothing is retried
//! or rewritten here; a resend is always a new caller action.

use async_trait::async_trait;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::chains::bitcoin::FinishedTransaction;
use crate::errors::{RejectionReason, Result, SendError};

/// What the network answered to a raw transaction submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum BroadcastResponse {
    Accepted { txid: String },
    Rejected { message: String },
}

#[async_trait]
pub trait BroadcastNetwork: Send + Sync {
    /// Transport failures are reported as `NetworkUnavailable`
    async fn broadcast(&self, raw_hex: &str) -> Result<BroadcastResponse>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReceipt {
    pub txid: Txid,
    /// The network already had this transaction
    pub already_known: bool,
}

const ALREADY_KNOWN: &[&str] = &[
    "already known",
    "already in block chain",
    "already in blockchain",
    "txn-already-known",
    "txn-already-in-mempool",
    "transaction already exists",
    "already in utxo set",
    "txn-same-nonwitness-data-in-mempool",
];

fn is_already_known(message: &str) -> bool {
    let message = message.to_lowercase();
    ALREADY_KNOWN.iter().any(|marker| message.contains(marker))
}

/// Map a node or indexer rejection message to a reason the UI can act on
pub fn classify_rejection(message: &str) -> RejectionReason {
    let message = message.to_lowercase();
    if message.contains("fee") {
        RejectionReason::FeeTooLow
    } else if message.contains("mempool-conflict")
        || message.contains("missingorspent")
        || message.contains("missing inputs")
        || message.contains("double spend")
        || message.contains("conflict")
    {
        RejectionReason::DoubleSpend
    } else if message.contains("decode") || message.contains("deserialize") || message.contains("malformed") {
        RejectionReason::Malformed
    } else if message.contains("non-standard") || message.contains("non-mandatory") || message.contains("dust") {
        RejectionReason::NonStandard
    } else {
        RejectionReason::Other
    }
}

pub struct Broadcaster {
    network: Arc<dyn BroadcastNetwork>,
}

impl Broadcaster {
    pub fn new(network: Arc<dyn BroadcastNetwork>) -> Self {
        Self { network }
    }

    pub async fn broadcast(&self, tx: &FinishedTransaction) -> Result<BroadcastReceipt> {
        let expected = tx.txid();
        log::info!("📡 Broadcasting {}", expected);

        match self.network.broadcast(tx.raw_hex()).await? {
            BroadcastResponse::Accepted { txid } => {
                let reported = Txid::from_str(txid.trim()).map_err(|_| SendError::TxidMismatch {
                    expected: expected.to_string(),
                    reported: txid.clone(),
                })?;
                if reported != expected {
                    log::error!("Network reported txid {} for {}", reported, expected);
                    return Err(SendError::TxidMismatch {
                        expected: expected.to_string(),
                        reported: reported.to_string(),
                    });
                }
                log::info!("✅ Broadcast accepted: {}", expected);
                Ok(BroadcastReceipt {
                    txid: expected,
                    already_known: false,
                })
            }
            BroadcastResponse::Rejected { message } if is_already_known(&message) => {
                log::info!("Transaction {} already known to the network", expected);
                Ok(BroadcastReceipt {
                    txid: expected,
                    already_known: true,
                })
            }
            BroadcastResponse::Rejected { message } => {
                let reason = classify_rejection(&message);
                log::error!("❌ Broadcast of {} rejected ({}): {}", expected, reason, message);
                Err(SendError::BroadcastRejected { reason, message })
            }
        }
    }
}
