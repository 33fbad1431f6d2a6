//! Session progress and challenge messages exchanged with the presentation layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::ChallengeKind;
use crate::errors::FailureReason;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SessionProgress {
    Dispatched { request_id: String },
    AwaitingPin,
    AwaitingPassphrase,
    AwaitingUserConfirmation,
    ChallengeRequested { kind: ChallengeKind },
    ChallengeRejected { kind: ChallengeKind, reason: FailureReason },
    Signed { txid: String },
    Failed { reason: FailureReason, message: String },
    Cancelled,
}

impl SessionProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionProgress::Signed { .. } | SessionProgress::Failed { .. } | SessionProgress::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: String,
    pub at: DateTime<Utc>,
    pub event: SessionProgress,
}

impl SessionEvent {
    pub fn new(session_id: &str, event: SessionProgress) -> Self {
        Self {
            session_id: session_id.to_string(),
            at: Utc::now(),
            event,
        }
    }
}

/// Answer to a `ChallengeRequested` event
#[derive(Clone, PartialEq, Eq)]
pub enum ChallengeResponse {
    Resolved {
        session_id: String,
        kind: ChallengeKind,
        secret: String,
    },
    Declined {
        session_id: String,
        kind: ChallengeKind,
    },
}

impl ChallengeResponse {
    pub fn session_id(&self) -> &str {
        match self {
            ChallengeResponse::Resolved { session_id, .. } | ChallengeResponse::Declined { session_id, .. } => {
                session_id
            }
        }
    }

    pub fn kind(&self) -> ChallengeKind {
        match self {
            ChallengeResponse::Resolved { kind, .. } | ChallengeResponse::Declined { kind, .. } => *kind,
        }
    }
}

impl std::fmt::Debug for ChallengeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengeResponse::Resolved { session_id, kind, .. } => f
                .debug_struct("Resolved")
                .field("session_id", session_id)
                .field("kind", kind)
                .finish_non_exhaustive(),
            ChallengeResponse::Declined { session_id, kind } => f
                .debug_struct("Declined")
                .field("session_id", session_id)
                .field("kind", kind)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_for_frontend() {
        let event = SessionEvent::new(
            "abc",
            SessionProgress::ChallengeRequested { kind: ChallengeKind::Passphrase },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sessionId"], "abc");
        assert_eq!(json["event"]["type"], "challengeRequested");
        assert_eq!(json["event"]["kind"], "passphrase");

        let failed = serde_json::to_value(SessionProgress::Failed {
            reason: FailureReason::UserRejected,
            message: "Rejected on device".to_string(),
        })
        .unwrap();
        assert_eq!(failed["reason"], "user_rejected");
    }

    #[test]
    fn test_challenge_secret_not_in_debug() {
        let response = ChallengeResponse::Resolved {
            session_id: "abc".to_string(),
            kind: ChallengeKind::Pin,
            secret: "8642".to_string(),
        };
        assert!(!format!("{:?}", response).contains("8642"));
        assert_eq!(response.kind(), ChallengeKind::Pin);
        assert_eq!(response.session_id(), "abc");
    }
}
