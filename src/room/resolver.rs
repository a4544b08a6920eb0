//! Room identity resolution: which conversation does an inbound event belong to?

use std::collections::{BTreeMap, HashSet, VecDeque};

use super::key::ConversationKey;
use crate::models::wire::IncomingMessage;
use crate::models::MessageId;

/// Outcome of classifying an inbound message against local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Belongs to the conversation currently on screen.
    Active(ConversationKey),
    /// Belongs to a tracked but inactive conversation.
    Other(ConversationKey),
    /// Nothing local tracks it.
    Reject(String),
}

/// Replay detection only looks this far back.
const SEEN_LIMIT: usize = 256;

#[derive(Debug, Default)]
struct Unread {
    count: u32,
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl Unread {
    /// Returns false for an id already counted.
    fn record(&mut self, id: &MessageId) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        if self.order.len() > SEEN_LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.count += 1;
        true
    }

    fn reset(&mut self) {
        self.count = 0;
        self.seen.clear();
        self.order.clear();
    }
}

/// Maps participant pairs and scopes to conversations and holds the single
/// active key.
#[derive(Debug, Default)]
pub struct RoomResolver {
    active: Option<ConversationKey>,
    tracked: BTreeMap<ConversationKey, Unread>,
}

impl RoomResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `key` the active conversation, returning the previous one.
    pub fn activate(&mut self, key: ConversationKey) -> Option<ConversationKey> {
        if let Some(unread) = self.tracked.get_mut(&key) {
            unread.reset();
        }
        self.active.replace(key)
    }

    pub fn deactivate(&mut self) -> Option<ConversationKey> {
        self.active.take()
    }

    pub fn active(&self) -> Option<&ConversationKey> {
        self.active.as_ref()
    }

    /// Start counting unread messages for `key`. Returns true if newly tracked.
    pub fn track(&mut self, key: ConversationKey) -> bool {
        if self.tracked.contains_key(&key) {
            return false;
        }
        self.tracked.insert(key, Unread::default());
        true
    }

    pub fn untrack(&mut self, key: &ConversationKey) -> bool {
        self.tracked.remove(key).is_some()
    }

    pub fn is_tracked(&self, key: &ConversationKey) -> bool {
        self.tracked.contains_key(key)
    }

    /// Every room the session must be joined to: the active key plus tracked ones.
    pub fn subscriptions(&self) -> Vec<ConversationKey> {
        let mut keys: Vec<ConversationKey> = self.tracked.keys().cloned().collect();
        if let Some(active) = &self.active {
            if !self.tracked.contains_key(active) {
                keys.push(active.clone());
            }
        }
        keys.sort();
        keys
    }

    /// Derive the conversation key an event claims to belong to.
    ///
    /// Transports either send a pre-joined room key or discrete participant
    /// ids; both forms are accepted.
    pub fn event_key(msg: &IncomingMessage) -> Result<ConversationKey, String> {
        if let Some(room) = &msg.room {
            let key = ConversationKey::parse(room).map_err(|e| e.to_string())?;
            if !key.pair().contains(&msg.sender.id) {
                return Err(format!("sender {} is not part of room {}", msg.sender.id, key));
            }
            return match (key.scope(), msg.scope_token.as_deref()) {
                (Some(a), Some(b)) if a != b => {
                    Err(format!("room scope {} disagrees with scope token {}", a, b))
                }
                (None, Some(token)) => Ok(ConversationKey::from_pair(
                    key.pair().clone(),
                    Some(token),
                )),
                _ => Ok(key),
            };
        }

        let receiver = msg
            .receiver_id
            .as_deref()
            .ok_or_else(|| "event carries neither room nor receiver".to_string())?;
        ConversationKey::derive(&[msg.sender.id.as_str(), receiver], msg.scope_token.as_deref())
            .map_err(|e| e.to_string())
    }

    /// Classify an inbound message.
    ///
    /// It belongs to the active conversation only when the participant pair
    /// matches and the scope matches exactly, including absence.
    pub fn classify(&self, msg: &IncomingMessage) -> Classification {
        let key = match Self::event_key(msg) {
            Ok(key) => key,
            Err(reason) => return Classification::Reject(reason),
        };

        if let Some(active) = &self.active {
            if active.contains_pair(key.pair()) && active.scope() == key.scope() {
                return Classification::Active(key);
            }
        }
        if self.tracked.contains_key(&key) {
            return Classification::Other(key);
        }
        Classification::Reject(format!("no local conversation tracks {}", key))
    }

    /// Count a message against an inactive tracked conversation.
    ///
    /// Replays of an already counted id do not count twice.
    pub fn record_unread(&mut self, key: &ConversationKey, id: &MessageId) -> u32 {
        if self.active.as_ref() == Some(key) {
            return 0;
        }
        match self.tracked.get_mut(key) {
            Some(unread) => {
                unread.record(id);
                unread.count
            }
            None => 0,
        }
    }

    pub fn unread(&self, key: &ConversationKey) -> u32 {
        self.tracked.get(key).map_or(0, |u| u.count)
    }

    /// Unread counts for tracked conversations other than the active one.
    pub fn unread_counts(&self) -> Vec<(ConversationKey, u32)> {
        self.tracked
            .iter()
            .filter(|(key, _)| self.active.as_ref() != Some(*key))
            .map(|(key, unread)| (key.clone(), unread.count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Participant, Role};
    use chrono::Utc;

    fn incoming(id: &str, sender: &str, receiver: Option<&str>, scope: Option<&str>) -> IncomingMessage {
        IncomingMessage {
            id: MessageId::Server(id.to_string()),
            sender: Participant::new(sender, sender, Role::Patient),
            receiver_id: receiver.map(String::from),
            room: None,
            body: "hello".to_string(),
            created_at: Utc::now(),
            scope_token: scope.map(String::from),
            client_id: None,
        }
    }

    fn key(scope: Option<&str>) -> ConversationKey {
        ConversationKey::derive(&["p1", "p2"], scope).unwrap()
    }

    #[test]
    fn test_scoped_active_never_admits_general_event() {
        let mut resolver = RoomResolver::new();
        resolver.activate(key(Some("req-42")));

        let general = incoming("m1", "p2", Some("p1"), None);
        assert!(matches!(resolver.classify(&general), Classification::Reject(_)));

        let scoped = incoming("m2", "p2", Some("p1"), Some("req-42"));
        assert_eq!(resolver.classify(&scoped), Classification::Active(key(Some("req-42"))));

        let other_scope = incoming("m3", "p2", Some("p1"), Some("req-7"));
        assert!(matches!(resolver.classify(&other_scope), Classification::Reject(_)));
    }

    #[test]
    fn test_general_active_never_admits_scoped_event() {
        let mut resolver = RoomResolver::new();
        resolver.activate(key(None));
        resolver.track(key(Some("req-42")));

        let scoped = incoming("m1", "p1", Some("p2"), Some("req-42"));
        assert_eq!(resolver.classify(&scoped), Classification::Other(key(Some("req-42"))));

        let general = incoming("m2", "p1", Some("p2"), None);
        assert_eq!(resolver.classify(&general), Classification::Active(key(None)));
    }

    #[test]
    fn test_room_form_event() {
        let mut resolver = RoomResolver::new();
        resolver.activate(key(Some("req-42")));

        let mut msg = incoming("m1", "p2", None, None);
        msg.room = Some("p2_p1:req-42".to_string());
        assert_eq!(resolver.classify(&msg), Classification::Active(key(Some("req-42"))));

        // Scope carried only as a field on a bare pair room.
        let mut msg = incoming("m2", "p2", None, Some("req-42"));
        msg.room = Some("p1_p2".to_string());
        assert_eq!(resolver.classify(&msg), Classification::Active(key(Some("req-42"))));

        // Conflicting scopes are rejected.
        let mut msg = incoming("m3", "p2", None, Some("req-9"));
        msg.room = Some("p1_p2:req-42".to_string());
        assert!(matches!(resolver.classify(&msg), Classification::Reject(_)));

        // Sender outside the room is rejected.
        let mut msg = incoming("m4", "p3", None, None);
        msg.room = Some("p1_p2:req-42".to_string());
        assert!(matches!(resolver.classify(&msg), Classification::Reject(_)));
    }

    #[test]
    fn test_unclassifiable_event_rejected() {
        let resolver = RoomResolver::new();
        let msg = incoming("m1", "p1", None, None);
        assert!(matches!(resolver.classify(&msg), Classification::Reject(_)));
    }

    #[test]
    fn test_unread_counts_ignore_replays_and_reset_on_activate() {
        let mut resolver = RoomResolver::new();
        let scoped = key(Some("req-1"));
        resolver.track(scoped.clone());

        let id = MessageId::Server("a".into());
        assert_eq!(resolver.record_unread(&scoped, &id), 1);
        assert_eq!(resolver.record_unread(&scoped, &id), 1);
        assert_eq!(resolver.record_unread(&scoped, &MessageId::Server("b".into())), 2);
        assert_eq!(resolver.unread_counts(), vec![(scoped.clone(), 2)]);

        resolver.activate(scoped.clone());
        assert_eq!(resolver.unread(&scoped), 0);
        assert!(resolver.unread_counts().is_empty());
        assert_eq!(resolver.record_unread(&scoped, &MessageId::Server("c".into())), 0);
    }

    #[test]
    fn test_replay_memory_is_bounded() {
        let mut resolver = RoomResolver::new();
        let general = key(None);
        resolver.track(general.clone());
        for n in 0..(SEEN_LIMIT + 10) {
            resolver.record_unread(&general, &MessageId::Server(n.to_string()));
        }
        let unread = &resolver.tracked[&general];
        assert_eq!(unread.count as usize, SEEN_LIMIT + 10);
        assert_eq!(unread.seen.len(), SEEN_LIMIT);
        assert_eq!(unread.order.len(), SEEN_LIMIT);

        // Recent replays are still ignored.
        let last = MessageId::Server((SEEN_LIMIT + 9).to_string());
        assert_eq!(resolver.record_unread(&general, &last), (SEEN_LIMIT + 10) as u32);
    }

    #[test]
    fn test_subscriptions_cover_active_and_tracked() {
        let mut resolver = RoomResolver::new();
        resolver.track(key(Some("req-1")));
        resolver.activate(key(None));
        assert_eq!(resolver.subscriptions(), vec![key(None), key(Some("req-1"))]);

        resolver.deactivate();
        assert_eq!(resolver.subscriptions(), vec![key(Some("req-1"))]);
        assert!(resolver.untrack(&key(Some("req-1"))));
        assert!(resolver.subscriptions().is_empty());
    }
}
