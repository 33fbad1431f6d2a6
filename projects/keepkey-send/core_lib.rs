//! KeepKey UTXO send core
//!
//! Coin selection, unsigned transaction assembly, device signing sessions and
//! broadcast for Bitcoin-family assets. No private keys are handled here; the
//! device signs.

pub mod broadcast;
pub mod chains;
pub mod coin_select;
pub mod config;
pub mod errors;
pub mod logging;
pub mod registry;
pub mod send_flow;
pub mod signing;
pub mod sources;

pub use broadcast::{BroadcastNetwork, BroadcastReceipt, BroadcastResponse, Broadcaster};
pub use chains::bitcoin::{FinishedTransaction, UnsignedTransaction};
pub use chains::ScriptType;
pub use coin_select::{CoinSelector, SelectionResult, SendAmount};
pub use config::SendConfig;
pub use errors::{FailureReason, RejectionReason, Result, SendError};
pub use registry::{ExtendedKey, KeyRegistry};
pub use send_flow::{FeeChoice, SendFlow, SendPlan, SendPlanner, SendRequest};
pub use signing::{
    ChallengeKind, ChallengeResponse, SessionEvent, SessionProgress, SessionState, SigningAuthority,
    SigningCoordinator, SigningSessionHandle,
};
pub use sources::{FeeOracle, FeeRates, FeeTier, Utxo, UtxoSource};
