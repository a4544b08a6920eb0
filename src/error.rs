//! Error taxonomy for the synchronization engine.
//!
//! Only `HistoryFetchFailed` and final send failures (`SendTimeout`,
//! `SendRejected`) are meant for the user. The rest are recovered locally and
//! only show up in logs.

use std::time::Duration;

use thiserror::Error;

use crate::models::MessageId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The channel never reached `authenticated`; sends use the fallback call.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A pending entry exceeded its reconciliation window.
    #[error("message {placeholder} not confirmed within {timeout:?}")]
    SendTimeout {
        placeholder: MessageId,
        timeout: Duration,
    },

    /// The send was rejected by the server or the fallback call failed.
    #[error("message {placeholder} rejected: {reason}")]
    SendRejected {
        placeholder: MessageId,
        reason: String,
    },

    /// History could not be fetched. Buffered entries stay visible.
    #[error("history fetch failed: {0}")]
    HistoryFetchFailed(String),

    /// Inbound payload failed decoding. Dropped, never shown.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// A suspended operation resolved after its conversation was deactivated.
    #[error("stale completion for conversation {0}")]
    StaleCompletion(String),

    #[error("no active conversation")]
    NoActiveConversation,

    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("invalid conversation key: {0}")]
    InvalidKey(String),

    /// An identical message is still pending; it must resolve before a retry.
    #[error("an identical message is already pending ({0})")]
    DuplicatePending(MessageId),

    #[error("message body is empty")]
    EmptyBody,

    #[error("no failed message {0} to retry")]
    UnknownFailure(MessageId),
}

impl SyncError {
    /// Whether this error should be surfaced to the user.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            SyncError::HistoryFetchFailed(_)
                | SyncError::SendTimeout { .. }
                | SyncError::SendRejected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_visible_errors() {
        assert!(SyncError::HistoryFetchFailed("503".into()).is_user_visible());
        assert!(SyncError::SendTimeout {
            placeholder: MessageId::Placeholder(1),
            timeout: Duration::from_secs(10),
        }
        .is_user_visible());
        assert!(!SyncError::MalformedEvent("no body".into()).is_user_visible());
        assert!(!SyncError::StaleCompletion("a_b".into()).is_user_visible());
        assert!(!SyncError::TransportUnavailable("offline".into()).is_user_visible());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::SendRejected {
            placeholder: MessageId::Placeholder(7),
            reason: "HTTP 500".into(),
        };
        assert_eq!(err.to_string(), "message local:7 rejected: HTTP 500");
    }
}
