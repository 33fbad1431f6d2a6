//! Signing session state machine

use serde::{Deserialize, Serialize};

use crate::errors::{FailureReason, Result, SendError};

/// Interrupt challenges the device can raise mid-signing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKind {
    Pin,
    Passphrase,
}

impl std::fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengeKind::Pin => write!(f, "PIN"),
            ChallengeKind::Passphrase => write!(f, "passphrase"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "reason")]
pub enum SessionState {
    Created,
    Dispatched,
    AwaitingPin,
    AwaitingPassphrase,
    AwaitingUserConfirmation,
    Signed,
    Failed(FailureReason),
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Signed | SessionState::Failed(_) | SessionState::Cancelled)
    }

    pub fn awaiting(kind: ChallengeKind) -> Self {
        match kind {
            ChallengeKind::Pin => SessionState::AwaitingPin,
            ChallengeKind::Passphrase => SessionState::AwaitingPassphrase,
        }
    }

    /// Whether the device protocol allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Created) => false,
            (_, Cancelled) | (_, Failed(_)) => true,
            (Created, Dispatched) => true,
            (Created, _) => false,
            // Re-dispatch after a rejected PIN
            (AwaitingPin, Dispatched) => true,
            (_, Dispatched) => false,
            (_, AwaitingPin) | (_, AwaitingPassphrase) | (_, AwaitingUserConfirmation) => true,
            (_, Signed) => true,
        }
    }

    pub fn transition_to(&mut self, next: SessionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(SendError::UnexpectedAuthorityState(format!(
                "invalid session transition {:?} -> {:?}",
                self, next
            )));
        }
        log::debug!("Session state {:?} -> {:?}", self, next);
        *self = next;
        Ok(())
    }
}
