//! Participant-related models

use serde::{Deserialize, Serialize};

/// Kind of participant taking part in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Patient,
    Pharmacy,
    Doctor,
    CustomerCare,
    /// Role string we do not recognise. Still a valid sender.
    #[serde(other)]
    Unknown,
}

impl Role {
    /// Lenient parse used for inbound payloads and CLI input.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "patient" | "user" => Role::Patient,
            "pharmacy" => Role::Pharmacy,
            "doctor" => Role::Doctor,
            "customer-care" | "customercare" | "care" => Role::CustomerCare,
            _ => Role::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Pharmacy => "pharmacy",
            Role::Doctor => "doctor",
            Role::CustomerCare => "customer-care",
            Role::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversation participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub role: Role,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
        }
    }
}
