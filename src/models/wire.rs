//! Wire formats shared by the push channel and the request/response API.
//!
//! Inbound payloads go through [`decode`] before they reach the merge engine.
//! Servers disagree on field names, so the DTO accepts a few aliases.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::message::{Message, MessageId, MessageStatus, PLACEHOLDER_PREFIX};
use super::participant::{Participant, Role};
use crate::room::ConversationKey;

/// Lenient message payload as it appears on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, alias = "message", skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// RFC 3339 string or epoch milliseconds.
    #[serde(default, alias = "timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<serde_json::Value>,
    #[serde(default, alias = "requestId", skip_serializing_if = "Option::is_none")]
    pub scope_token: Option<String>,
    /// Pre-joined conversation key, when the transport sends one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Correlation id echoed back for a speculative send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// A decoded inbound message, not yet admitted to any conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub id: MessageId,
    pub sender: Participant,
    pub receiver_id: Option<String>,
    pub room: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub scope_token: Option<String>,
    pub client_id: Option<String>,
}

impl IncomingMessage {
    /// Admit into the conversation identified by `key` as a confirmed message.
    pub fn into_message(self, key: ConversationKey) -> Message {
        Message {
            id: self.id,
            conversation_key: key,
            sender: self.sender,
            body: self.body,
            created_at: self.created_at,
            scope_token: self.scope_token,
            status: MessageStatus::Confirmed,
        }
    }
}

/// Result of the decode step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Message(IncomingMessage),
    Malformed(String),
}

/// Decode a raw JSON payload.
pub fn decode_value(value: &serde_json::Value, received_at: DateTime<Utc>) -> Decoded {
    match serde_json::from_value::<WireMessage>(value.clone()) {
        Ok(wire) => decode(wire, received_at),
        Err(e) => Decoded::Malformed(format!("unexpected payload shape: {}", e)),
    }
}

/// Classify a wire message as valid or malformed.
///
/// A missing sender or body is malformed. A missing timestamp falls back to
/// the time of receipt.
pub fn decode(wire: WireMessage, received_at: DateTime<Utc>) -> Decoded {
    let sender_id = match non_blank(wire.sender_id) {
        Some(id) => id,
        None => return Decoded::Malformed("missing senderId".to_string()),
    };
    let body = match wire.body {
        Some(body) if !body.trim().is_empty() => body,
        _ => return Decoded::Malformed(format!("missing body from {}", sender_id)),
    };

    let created_at = wire
        .created_at
        .as_ref()
        .and_then(parse_timestamp)
        .unwrap_or(received_at);
    let scope_token = non_blank(wire.scope_token);

    let id = match non_blank(wire.id) {
        Some(id) if id.starts_with(PLACEHOLDER_PREFIX) => {
            return Decoded::Malformed(format!("id {} uses the placeholder namespace", id));
        }
        Some(id) => MessageId::Server(id),
        None => MessageId::Content(fingerprint(
            &sender_id,
            created_at,
            &body,
            scope_token.as_deref(),
        )),
    };

    let display_name = non_blank(wire.sender_name).unwrap_or_else(|| sender_id.clone());
    let role = wire
        .sender_role
        .as_deref()
        .map(Role::parse)
        .unwrap_or(Role::Unknown);

    Decoded::Message(IncomingMessage {
        id,
        sender: Participant::new(sender_id, display_name, role),
        receiver_id: non_blank(wire.receiver_id),
        room: non_blank(wire.room),
        body,
        created_at,
        scope_token,
        client_id: non_blank(wire.client_id),
    })
}

/// Outbound `sendMessage` action and fallback request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub room: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_token: Option<String>,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
}

impl OutgoingMessage {
    /// Build from a speculative entry.
    pub fn from_pending(message: &Message) -> Self {
        let key = &message.conversation_key;
        Self {
            room: key.to_string(),
            sender_id: message.sender.id.clone(),
            sender_name: message.sender.display_name.clone(),
            sender_role: message.sender.role,
            receiver_id: key.pair().peer_of(&message.sender.id).map(String::from),
            body: message.body.clone(),
            scope_token: message.scope_token.clone(),
            client_id: message.id.to_string(),
            created_at: message.created_at,
        }
    }
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(from_millis)),
        serde_json::Value::Number(n) => n.as_i64().and_then(from_millis),
        _ => None,
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Unstamped payloads are fingerprinted with their receipt time.
fn fingerprint(sender: &str, at: DateTime<Utc>, body: &str, scope: Option<&str>) -> u64 {
    let mut hasher = DefaultHasher::new();
    sender.hash(&mut hasher);
    at.timestamp_millis().hash(&mut hasher);
    body.hash(&mut hasher);
    scope.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn expect_message(decoded: Decoded) -> IncomingMessage {
        match decoded {
            Decoded::Message(m) => m,
            Decoded::Malformed(reason) => panic!("unexpected malformed: {}", reason),
        }
    }

    #[test]
    fn test_decode_full_payload() {
        let payload = json!({
            "_id": "srv-1",
            "senderId": "p1",
            "senderName": "Pat",
            "senderRole": "patient",
            "receiverId": "d9",
            "message": "hello",
            "createdAt": "2024-05-01T11:59:00Z",
            "requestId": "req-42"
        });
        let msg = expect_message(decode_value(&payload, now()));
        assert_eq!(msg.id, MessageId::Server("srv-1".into()));
        assert_eq!(msg.sender.display_name, "Pat");
        assert_eq!(msg.sender.role, Role::Patient);
        assert_eq!(msg.body, "hello");
        assert_eq!(msg.scope_token.as_deref(), Some("req-42"));
        assert_eq!(msg.receiver_id.as_deref(), Some("d9"));
        assert_eq!(msg.created_at, Utc.with_ymd_and_hms(2024, 5, 1, 11, 59, 0).unwrap());
    }

    #[test]
    fn test_decode_missing_sender_or_body() {
        let no_sender = json!({ "body": "hi" });
        assert!(matches!(decode_value(&no_sender, now()), Decoded::Malformed(_)));

        let blank_body = json!({ "senderId": "p1", "body": "   " });
        assert!(matches!(decode_value(&blank_body, now()), Decoded::Malformed(_)));

        let not_an_object = json!(["p1", "hi"]);
        assert!(matches!(decode_value(&not_an_object, now()), Decoded::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_placeholder_namespace() {
        let payload = json!({ "id": "local:3", "senderId": "p1", "body": "hi" });
        assert!(matches!(decode_value(&payload, now()), Decoded::Malformed(_)));
    }

    #[test]
    fn test_decode_defaults() {
        let payload = json!({ "senderId": "p1", "body": "hi", "scopeToken": "" });
        let msg = expect_message(decode_value(&payload, now()));
        assert_eq!(msg.created_at, now());
        assert_eq!(msg.sender.display_name, "p1");
        assert_eq!(msg.sender.role, Role::Unknown);
        assert_eq!(msg.scope_token, None);
        assert!(matches!(msg.id, MessageId::Content(_)));
    }

    #[test]
    fn test_epoch_millis_timestamp() {
        let payload = json!({ "senderId": "p1", "body": "hi", "timestamp": 1714564800000i64 });
        let msg = expect_message(decode_value(&payload, now()));
        assert_eq!(msg.created_at, now());
    }

    #[test]
    fn test_idless_replays_share_fingerprint() {
        let payload = json!({ "senderId": "p1", "body": "hi", "createdAt": "2024-05-01T11:00:00Z" });
        let first = expect_message(decode_value(&payload, now()));
        let replay = expect_message(decode_value(&payload, now() + chrono::Duration::seconds(5)));
        assert_eq!(first.id, replay.id);

        let other = json!({ "senderId": "p1", "body": "hi!", "createdAt": "2024-05-01T11:00:00Z" });
        let other = expect_message(decode_value(&other, now()));
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn test_unstamped_repeats_get_distinct_ids() {
        let payload = json!({ "senderId": "p2", "body": "ok" });
        let first = expect_message(decode_value(&payload, now() + chrono::Duration::seconds(1)));
        let second = expect_message(decode_value(&payload, now() + chrono::Duration::seconds(60)));
        assert_ne!(first.id, second.id);
        assert_eq!(second.created_at, now() + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_outgoing_from_pending() {
        let key = ConversationKey::derive(&["p1", "d9"], Some("req-42")).unwrap();
        let pending = Message {
            id: MessageId::Placeholder(4),
            conversation_key: key,
            sender: Participant::new("p1", "Pat", Role::Patient),
            body: "test".into(),
            created_at: now(),
            scope_token: Some("req-42".into()),
            status: MessageStatus::Pending,
        };
        let out = OutgoingMessage::from_pending(&pending);
        assert_eq!(out.room, "d9_p1:req-42");
        assert_eq!(out.receiver_id.as_deref(), Some("d9"));
        assert_eq!(out.client_id, "local:4");

        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["senderRole"], "patient");
        assert_eq!(json["scopeToken"], "req-42");
    }
}
