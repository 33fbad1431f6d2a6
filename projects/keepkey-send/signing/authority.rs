//! Signing authority protocol
//!
//! Mirrors the KeepKey request/response exchange: one `SignTx` starts the
//! flow, the device answers with interrupts (PIN matrix, passphrase, button)
//! until it returns the signed transaction or a failure.

use async_trait::async_trait;
use thiserror::Error;

use crate::chains::bitcoin::UnsignedTransaction;
use crate::errors::SendError;

#[derive(Clone)]
pub enum AuthorityRequest {
    SignTx { request_id: String, tx: UnsignedTransaction },
    PinMatrixAck { pin: String },
    PassphraseAck { passphrase: String },
    ButtonAck,
}

impl AuthorityRequest {
    pub fn name(&self) -> &'static str {
        match self {
            AuthorityRequest::SignTx { .. } => "SignTx",
            AuthorityRequest::PinMatrixAck { .. } => "PinMatrixAck",
            AuthorityRequest::PassphraseAck { .. } => "PassphraseAck",
            AuthorityRequest::ButtonAck => "ButtonAck",
        }
    }
}

// Secrets stay out of logs
impl std::fmt::Debug for AuthorityRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorityRequest::SignTx { request_id, tx } => f
                .debug_struct("SignTx")
                .field("request_id", request_id)
                .field("inputs", &tx.inputs.len())
                .field("outputs", &tx.outputs.len())
                .finish(),
            AuthorityRequest::PinMatrixAck { .. } => f.write_str("PinMatrixAck { pin: <redacted> }"),
            AuthorityRequest::PassphraseAck { .. } => f.write_str("PassphraseAck { passphrase: <redacted> }"),
            AuthorityRequest::ButtonAck => f.write_str("ButtonAck"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityResponse {
    PinMatrixRequest,
    PassphraseRequest,
    ButtonRequest,
    TxSigned { serialized_tx: Vec<u8> },
    Failure { code: FailureCode, message: String },
}

/// Device failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    UnexpectedMessage,
    ButtonExpected,
    SyntaxError,
    ActionCancelled,
    PinExpected,
    PinCancelled,
    PinInvalid,
    InvalidSignature,
    ProcessError,
    NotEnoughFunds,
    NotInitialized,
    PinMismatch,
    FirmwareError,
    Unknown(i32),
}

impl FailureCode {
    /// Terminal error for a device failure
    pub fn into_error(self, message: &str) -> SendError {
        match self {
            FailureCode::PinInvalid => SendError::IncorrectPin,
            FailureCode::ActionCancelled | FailureCode::PinCancelled => SendError::UserRejected,
            other => SendError::UnexpectedAuthorityState(format!("{:?}: {}", other, message)),
        }
    }
}

/// Transport-level failure talking to the device
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct AuthorityError(pub String);

#[async_trait]
pub trait SigningAuthority: Send + Sync {
    /// Send one request and wait for the device's next message
    async fn call(&self, request: AuthorityRequest) -> Result<AuthorityResponse, AuthorityError>;

    /// Abort whatever the device is currently waiting on
    async fn cancel(&self) -> Result<(), AuthorityError>;
}
