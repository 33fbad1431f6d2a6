use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signing::ChallengeKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Insufficient funds: need {needed} sats, have {available} sats")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("No spendable outputs found for asset {0}")]
    NoSpendableAssetFound(String),

    #[error("Invalid destination {address}: {reason}")]
    InvalidDestination { address: String, reason: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid extended public key: {0}")]
    InvalidExtendedKey(String),

    #[error("No registered key for {0}")]
    UnknownKey(String),

    #[error("UTXO {outpoint} does not belong to its key: {reason}")]
    UtxoKeyMismatch { outpoint: String, reason: String },

    #[error("Legacy input {outpoint} requires the full previous transaction")]
    MissingPreviousTransaction { outpoint: String },

    #[error("Previous transaction for {outpoint} does not match: {reason}")]
    PreviousTransactionMismatch { outpoint: String, reason: String },

    #[error("A signing session is already active on this device")]
    SessionAlreadyActive,

    #[error("The {0} challenge was already answered in this session")]
    DuplicateChallengeResponse(ChallengeKind),

    #[error("No {0} challenge is pending")]
    ChallengeNotPending(ChallengeKind),

    #[error("Signing device unavailable: {0}")]
    AuthorityUnavailable(String),

    #[error("Incorrect PIN")]
    IncorrectPin,

    #[error("Rejected on device")]
    UserRejected,

    #[error("Unexpected device state: {0}")]
    UnexpectedAuthorityState(String),

    #[error("Signing session timed out after {0} ms")]
    Timeout(u64),

    #[error("Signing session cancelled")]
    Cancelled,

    #[error("Broadcast rejected ({reason}): {message}")]
    BroadcastRejected { reason: RejectionReason, message: String },

    #[error("Network reported txid {reported}, expected {expected}")]
    TxidMismatch { expected: String, reported: String },

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("UTXO source error: {0}")]
    UtxoSource(String),

    #[error("Fee oracle error: {0}")]
    FeeOracle(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SendError {
    /// Stable code for the presentation layer.
    pub fn kind(&self) -> &'static str {
        match self {
            SendError::InsufficientFunds { .. } => "insufficient_funds",
            SendError::NoSpendableAssetFound(_) => "no_spendable_asset_found",
            SendError::InvalidDestination { .. } => "invalid_destination",
            SendError::InvalidAmount(_) => "invalid_amount",
            SendError::InvalidExtendedKey(_) => "invalid_extended_key",
            SendError::UnknownKey(_) => "unknown_key",
            SendError::UtxoKeyMismatch { .. } => "utxo_key_mismatch",
            SendError::MissingPreviousTransaction { .. } => "missing_previous_transaction",
            SendError::PreviousTransactionMismatch { .. } => "previous_transaction_mismatch",
            SendError::SessionAlreadyActive => "session_already_active",
            SendError::DuplicateChallengeResponse(_) => "duplicate_challenge_response",
            SendError::ChallengeNotPending(_) => "challenge_not_pending",
            SendError::AuthorityUnavailable(_) => "authority_unavailable",
            SendError::IncorrectPin => "incorrect_pin",
            SendError::UserRejected => "user_rejected",
            SendError::UnexpectedAuthorityState(_) => "unexpected_authority_state",
            SendError::Timeout(_) => "timeout",
            SendError::Cancelled => "cancelled",
            SendError::BroadcastRejected { .. } => "broadcast_rejected",
            SendError::TxidMismatch { .. } => "txid_mismatch",
            SendError::NetworkUnavailable(_) => "network_unavailable",
            SendError::UtxoSource(_) => "utxo_source",
            SendError::FeeOracle(_) => "fee_oracle",
            SendError::Config(_) => "config",
        }
    }

    /// Terminal signing failure reason, if this error ends a signing session
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            SendError::AuthorityUnavailable(_) => Some(FailureReason::AuthorityUnavailable),
            SendError::IncorrectPin => Some(FailureReason::IncorrectPin),
            SendError::UserRejected => Some(FailureReason::UserRejected),
            SendError::UnexpectedAuthorityState(_) => Some(FailureReason::UnexpectedAuthorityState),
            SendError::Timeout(_) => Some(FailureReason::Timeout),
            _ => None,
        }
    }
}

/// Why a signing session ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    AuthorityUnavailable,
    IncorrectPin,
    UserRejected,
    UnexpectedAuthorityState,
    Timeout,
}

/// Classified broadcast rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    FeeTooLow,
    DoubleSpend,
    Malformed,
    NonStandard,
    Other,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::FeeTooLow => write!(f, "fee too low"),
            RejectionReason::DoubleSpend => write!(f, "double spend"),
            RejectionReason::Malformed => write!(f, "malformed"),
            RejectionReason::NonStandard => write!(f, "non-standard"),
            RejectionReason::Other => write!(f, "other"),
        }
    }
}

pub type Result<T> = std::result::Result<T, SendError>;
