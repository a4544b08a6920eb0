//! Socket.IO v1 text framing.
//!
//! `1::` connect, `2::` heartbeat, `5:[id[+]]::{"name":..,"args":[..]}` event,
//! `6:<id>::` ack. Anything else is passed through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Connect,
    Heartbeat,
    Event {
        /// Set when the sender expects an ack.
        ack_id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: u64,
    },
    Other(String),
}

#[derive(Serialize, Deserialize)]
struct EventBody {
    name: String,
    #[serde(default)]
    args: Vec<Value>,
}

impl Frame {
    /// Event frame with a single payload argument.
    pub fn event(name: &str, payload: Value) -> Self {
        Frame::Event {
            ack_id: None,
            name: name.to_string(),
            args: vec![payload],
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Frame::Connect => "1::".to_string(),
            Frame::Heartbeat => "2::".to_string(),
            Frame::Event { ack_id, name, args } => {
                let body = serde_json::json!({ "name": name, "args": args });
                match ack_id {
                    Some(id) => format!("5:{}+::{}", id, body),
                    None => format!("5:::{}", body),
                }
            }
            Frame::Ack { id } => format!("6:{}::", id),
            Frame::Other(text) => text.clone(),
        }
    }

    pub fn decode(text: &str) -> Self {
        if text.starts_with("1::") {
            return Frame::Connect;
        }
        if text.starts_with("2::") {
            return Frame::Heartbeat;
        }
        if let Some(rest) = text.strip_prefix("5:") {
            return decode_event(rest).unwrap_or_else(|| Frame::Other(text.to_string()));
        }
        if let Some(rest) = text.strip_prefix("6:") {
            if let Some(id) = leading_id(rest) {
                return Frame::Ack { id };
            }
        }
        Frame::Other(text.to_string())
    }
}

/// `ID:ENDPOINT:JSON`, where ID may carry a trailing `+`.
fn decode_event(rest: &str) -> Option<Frame> {
    let (id_part, after) = rest.split_once(':')?;
    let json = after.split_once(':').map(|(_, json)| json)?;
    let body: EventBody = serde_json::from_str(json).ok()?;
    let id_part = id_part.trim_end_matches('+');
    let ack_id = if id_part.is_empty() {
        None
    } else {
        Some(id_part.parse().ok()?)
    };
    Some(Frame::Event {
        ack_id,
        name: body.name,
        args: body.args,
    })
}

fn leading_id(rest: &str) -> Option<u64> {
    let digits: String = rest
        .trim_start_matches(':')
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_control_frames() {
        assert_eq!(Frame::decode("1::"), Frame::Connect);
        assert_eq!(Frame::decode("2::"), Frame::Heartbeat);
        assert_eq!(Frame::decode("6:12::"), Frame::Ack { id: 12 });
        assert_eq!(Frame::decode("6:::12"), Frame::Ack { id: 12 });
        assert_eq!(Frame::decode("0::"), Frame::Other("0::".into()));
    }

    #[test]
    fn test_decode_event_with_ack_id() {
        let frame = Frame::decode(r#"5:7+::{"name":"message","args":[{"body":"hi"}]}"#);
        assert_eq!(
            frame,
            Frame::Event {
                ack_id: Some(7),
                name: "message".into(),
                args: vec![json!({ "body": "hi" })],
            }
        );
    }

    #[test]
    fn test_decode_event_without_ack_id() {
        let frame = Frame::decode(r#"5:::{"name":"authenticated"}"#);
        assert_eq!(
            frame,
            Frame::Event {
                ack_id: None,
                name: "authenticated".into(),
                args: vec![],
            }
        );
    }

    #[test]
    fn test_bad_event_json_passes_through() {
        let text = "5:::{not json";
        assert_eq!(Frame::decode(text), Frame::Other(text.into()));
    }

    #[test]
    fn test_encode_event() {
        let frame = Frame::event("joinRoom", json!({ "room": "p1_p2" }));
        let text = frame.encode();
        assert!(text.starts_with("5:::"));
        assert_eq!(Frame::decode(&text), frame);
        assert_eq!(Frame::Ack { id: 3 }.encode(), "6:3::");
    }
}
