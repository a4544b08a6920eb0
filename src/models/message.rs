//! Message-related models

use std::fmt;

use chrono::{DateTime, Utc};

use super::participant::Participant;
use crate::room::ConversationKey;

/// Reserved namespace for locally issued placeholder ids.
pub const PLACEHOLDER_PREFIX: &str = "local:";

/// Message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageId {
    /// Persistent id issued by the server.
    Server(String),
    /// Fingerprint for pushed events that carry no id (sender, time, body).
    Content(u64),
    /// Session-local placeholder for a speculative send. Never reused.
    Placeholder(u64),
}

impl MessageId {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, MessageId::Placeholder(_))
    }

    /// Whether the id came from the server side (server id or content fingerprint).
    pub fn is_authoritative(&self) -> bool {
        !self.is_placeholder()
    }

    /// Parse a client correlation id (`local:<n>`) back into a placeholder id.
    pub fn parse_placeholder(s: &str) -> Option<Self> {
        s.strip_prefix(PLACEHOLDER_PREFIX)?
            .parse()
            .ok()
            .map(MessageId::Placeholder)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => f.write_str(id),
            MessageId::Content(hash) => write!(f, "content:{:016x}", hash),
            MessageId::Placeholder(n) => write!(f, "{}{}", PLACEHOLDER_PREFIX, n),
        }
    }
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Confirmed,
    Pending,
    Failed,
}

/// A message admitted into a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_key: ConversationKey,
    pub sender: Participant,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub scope_token: Option<String>,
    pub status: MessageStatus,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }

    /// Content match used for reconciling a speculative send.
    pub fn same_content(&self, other: &Message) -> bool {
        self.sender.id == other.sender.id
            && self.body == other.body
            && self.scope_token == other.scope_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_roundtrip_through_client_id() {
        let id = MessageId::Placeholder(42);
        assert_eq!(id.to_string(), "local:42");
        assert_eq!(MessageId::parse_placeholder("local:42"), Some(id));
        assert_eq!(MessageId::parse_placeholder("srv-42"), None);
        assert_eq!(MessageId::parse_placeholder("local:x"), None);
    }

    #[test]
    fn test_id_kinds() {
        assert!(MessageId::Placeholder(1).is_placeholder());
        assert!(MessageId::Server("a".into()).is_authoritative());
        assert!(MessageId::Content(7).is_authoritative());
    }
}
