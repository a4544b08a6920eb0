//! Online/offline indicator driven by session transitions.

use crate::transport::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Offline => "offline",
        }
    }
}

/// Online only while the channel can carry room traffic.
#[derive(Debug)]
pub struct PresenceTracker {
    current: Presence,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self {
            current: Presence::Offline,
        }
    }
}

impl PresenceTracker {
    /// Fold in a session transition. Returns true if the indicator changed.
    pub fn apply(&mut self, state: SessionState) -> bool {
        let next = if state.is_ready() {
            Presence::Online
        } else {
            Presence::Offline
        };
        let changed = next != self.current;
        self.current = next;
        changed
    }

    pub fn current(&self) -> Presence {
        self.current
    }

    pub fn is_online(&self) -> bool {
        self.current == Presence::Online
    }
}
