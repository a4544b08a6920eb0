//! Canonical conversation keys.
//!
//! A pair key is the two participant ids sorted lexicographically and joined
//! with `_`. A scoped conversation appends `:<scope>` so a request-scoped chat
//! never collapses into the general chat between the same two people.

use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

const PAIR_SEPARATOR: char = '_';
const SCOPE_SEPARATOR: char = ':';

/// Order-independent key for a pair of participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey(String);

impl PairKey {
    /// Derive the pair key from exactly two participant ids.
    pub fn derive<S: AsRef<str>>(ids: &[S]) -> Result<Self, SyncError> {
        if ids.len() != 2 {
            return Err(SyncError::InvalidParticipants(format!(
                "expected exactly two participants, got {}",
                ids.len()
            )));
        }
        let a = validate_id(ids[0].as_ref())?;
        let b = validate_id(ids[1].as_ref())?;
        if a == b {
            return Err(SyncError::InvalidParticipants(format!(
                "participant {} cannot chat with itself",
                a
            )));
        }
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self(format!("{}{}{}", lo, PAIR_SEPARATOR, hi)))
    }

    /// Parse an already-joined pair key, normalising the order.
    pub fn parse(s: &str) -> Result<Self, SyncError> {
        let (a, b) = s
            .split_once(PAIR_SEPARATOR)
            .ok_or_else(|| SyncError::InvalidKey(format!("missing pair separator in {:?}", s)))?;
        Self::derive(&[a, b]).map_err(|e| SyncError::InvalidKey(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `id` is one of the two participants.
    pub fn contains(&self, id: &str) -> bool {
        self.participants().iter().any(|p| *p == id)
    }

    /// The two participant ids in sorted order.
    pub fn participants(&self) -> [&str; 2] {
        match self.0.split_once(PAIR_SEPARATOR) {
            Some((lo, hi)) => [lo, hi],
            None => [self.0.as_str(), ""],
        }
    }

    /// The other participant, from `me`'s point of view.
    pub fn peer_of(&self, me: &str) -> Option<&str> {
        match self.participants() {
            [lo, hi] if lo == me => Some(hi),
            [lo, hi] if hi == me => Some(lo),
            _ => None,
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical identifier for one logical conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
    pair: PairKey,
    scope: Option<String>,
}

impl ConversationKey {
    /// Derive a key from two participant ids and an optional scope token.
    ///
    /// A blank scope (e.g. an empty route parameter) means "general".
    pub fn derive<S: AsRef<str>>(ids: &[S], scope: Option<&str>) -> Result<Self, SyncError> {
        Ok(Self::from_pair(PairKey::derive(ids)?, scope))
    }

    pub fn from_pair(pair: PairKey, scope: Option<&str>) -> Self {
        let scope = scope
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);
        Self { pair, scope }
    }

    /// Parse a composite key as sent by transports that pre-join rooms.
    pub fn parse(composite: &str) -> Result<Self, SyncError> {
        let composite = composite.trim();
        let (pair, scope) = match composite.split_once(SCOPE_SEPARATOR) {
            Some((pair, scope)) => (pair, Some(scope)),
            None => (composite, None),
        };
        Ok(Self::from_pair(PairKey::parse(pair)?, scope))
    }

    pub fn pair(&self) -> &PairKey {
        &self.pair
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    /// Composite-key membership test: does this key belong to `pair`?
    pub fn contains_pair(&self, pair: &PairKey) -> bool {
        &self.pair == pair
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}{}{}", self.pair, SCOPE_SEPARATOR, scope),
            None => write!(f, "{}", self.pair),
        }
    }
}

impl FromStr for ConversationKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn validate_id(id: &str) -> Result<&str, SyncError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(SyncError::InvalidParticipants(
            "participant id is empty".to_string(),
        ));
    }
    if id.contains(PAIR_SEPARATOR) || id.contains(SCOPE_SEPARATOR) {
        return Err(SyncError::InvalidParticipants(format!(
            "participant id {:?} contains a reserved separator",
            id
        )));
    }
    Ok(id)
}
