//! In-memory state of the active conversation.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::merge::{merge, Entry};
use super::outbox::{Outbox, SendFailure};
use crate::error::SyncError;
use crate::models::{Message, MessageId};
use crate::room::ConversationKey;

/// How far an id-less copy's timestamp may sit from the echoed server copy.
const ECHO_WINDOW_SECS: i64 = 2;

/// Position an authoritative id occupies in the sequence.
#[derive(Debug, Clone, Copy)]
struct Slot {
    seq: u64,
    /// Set once the id took over a placeholder's position.
    pinned_at: Option<DateTime<Utc>>,
}

/// One conversation: history, pushed events and speculative sends, plus the
/// rendered sequence derived from them.
pub struct Conversation {
    key: ConversationKey,
    history: Vec<Entry>,
    pushed: Vec<Entry>,
    outbox: Outbox,
    next_seq: u64,
    slots: HashMap<MessageId, Slot>,
    /// placeholder -> the id that confirmed it
    resolved: HashMap<MessageId, MessageId>,
    /// Ids confirmed by direct echo that an id-less push may still
    /// duplicate, with the server's timestamp.
    echoed: HashMap<MessageId, DateTime<Utc>>,
    view: Vec<Message>,
    history_loaded: bool,
}

impl Conversation {
    pub fn new(key: ConversationKey, send_timeout: Duration) -> Self {
        Self {
            key,
            history: Vec::new(),
            pushed: Vec::new(),
            outbox: Outbox::new(send_timeout),
            next_seq: 0,
            slots: HashMap::new(),
            resolved: HashMap::new(),
            echoed: HashMap::new(),
            view: Vec::new(),
            history_loaded: false,
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// The rendered, ordered sequence.
    pub fn messages(&self) -> &[Message] {
        &self.view
    }

    pub fn history_loaded(&self) -> bool {
        self.history_loaded
    }

    pub fn pending(&self, id: &MessageId) -> Option<&Message> {
        self.outbox.get(id)
    }

    pub fn pending_count(&self) -> usize {
        self.outbox.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.outbox.next_deadline()
    }

    fn knows(&self, id: &MessageId) -> bool {
        self.history
            .iter()
            .chain(&self.pushed)
            .any(|e| &e.message.id == id)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Assign the insertion sequence, reusing the slot an id already holds.
    fn admit(&mut self, mut message: Message) -> Entry {
        let slot = match self.slots.get(&message.id) {
            Some(slot) => *slot,
            None => {
                let slot = Slot {
                    seq: self.take_seq(),
                    pinned_at: None,
                };
                self.slots.insert(message.id.clone(), slot);
                slot
            }
        };
        if let Some(at) = slot.pinned_at {
            message.created_at = at;
        }
        Entry::new(slot.seq, message)
    }

    /// Move `id` into a placeholder's position, in every buffer that holds it.
    fn pin(&mut self, id: &MessageId, seq: u64, at: DateTime<Utc>) {
        self.slots.insert(
            id.clone(),
            Slot {
                seq,
                pinned_at: Some(at),
            },
        );
        for entry in self.history.iter_mut().chain(self.pushed.iter_mut()) {
            if &entry.message.id == id {
                entry.seq = seq;
                entry.message.created_at = at;
            }
        }
    }

    /// Replace the history buffer with a fresh batch.
    ///
    /// Pushed entries the batch now covers are pruned; ids keep their slots.
    pub fn apply_history(&mut self, batch: Vec<Message>) {
        let mut history = Vec::with_capacity(batch.len());
        for message in batch {
            history.push(self.admit(message));
        }
        let ids: HashSet<&MessageId> = history.iter().map(|e| &e.message.id).collect();
        self.pushed.retain(|e| !ids.contains(&e.message.id));
        self.echoed.retain(|id, _| !ids.contains(id));
        self.resolved
            .retain(|_, id| matches!(id, MessageId::Content(_)) || !ids.contains(&*id));
        let pushed = &self.pushed;
        self.slots
            .retain(|id, _| ids.contains(id) || pushed.iter().any(|e| &e.message.id == id));
        self.history = history;
        self.history_loaded = true;
        self.refresh();
    }

    /// Admit a pushed message. Returns false if it was a duplicate.
    pub fn apply_push(&mut self, message: Message) -> bool {
        if self.knows(&message.id) {
            return false;
        }
        if matches!(message.id, MessageId::Content(_)) {
            let window = chrono::Duration::seconds(ECHO_WINDOW_SECS);
            let echoed = self.echoed.iter().find(|(id, at)| {
                (message.created_at - **at).abs() <= window
                    && self
                        .view
                        .iter()
                        .any(|m| &m.id == *id && m.same_content(&message))
            });
            if let Some(id) = echoed.map(|(id, _)| id.clone()) {
                tracing::debug!("Dropping id-less copy of echoed message {}", id);
                self.echoed.remove(&id);
                return false;
            }
        }
        let entry = self.admit(message);
        self.pushed.push(entry);
        self.refresh();
        true
    }

    /// Add a speculative entry at the tail of the sequence.
    pub fn stage(&mut self, message: Message, now: Instant) -> Result<(), SyncError> {
        let seq = self.next_seq;
        self.outbox.stage(Entry::new(seq, message), now)?;
        self.next_seq += 1;
        self.refresh();
        Ok(())
    }

    /// Identifier-based reconciliation: `message` is the server copy of
    /// `placeholder`. Returns false when the placeholder was already resolved.
    pub fn confirm(&mut self, placeholder: &MessageId, message: Message) -> bool {
        if let Some(pending) = self.outbox.get(placeholder) {
            if pending.sender.id != message.sender.id || pending.body != message.body {
                tracing::warn!(
                    "Echo {} does not match the content of {}, treating it as a push",
                    message.id,
                    placeholder
                );
                self.apply_push(message);
                return false;
            }
        }
        if let Some(entry) = self.outbox.resolve(placeholder) {
            let id = message.id.clone();
            let server_at = message.created_at;
            if !self.knows(&id) {
                let admitted = self.admit(message);
                self.pushed.push(admitted);
            }
            self.pin(&id, entry.seq, entry.message.created_at);
            self.resolved.insert(placeholder.clone(), id.clone());
            self.echoed.insert(id, server_at);
            self.refresh();
            return true;
        }

        match self.resolved.get(placeholder).cloned() {
            Some(prev) if prev == message.id => {}
            Some(prev @ MessageId::Content(_)) => {
                // A content match got there first. Upgrade it to the server id.
                if let Some(slot) = self.slots.remove(&prev) {
                    self.slots.insert(message.id.clone(), slot);
                }
                let replacement = self.admit(message);
                for entry in self.history.iter_mut().chain(self.pushed.iter_mut()) {
                    if entry.message.id == prev {
                        *entry = replacement.clone();
                    }
                }
                self.resolved
                    .insert(placeholder.clone(), replacement.message.id.clone());
                self.refresh();
            }
            _ => {
                self.apply_push(message);
            }
        }
        false
    }

    /// Mark a speculative entry failed and drop it from the sequence.
    pub fn fail(&mut self, placeholder: &MessageId, error: SyncError) -> Option<SendFailure> {
        let failure = self.outbox.fail(placeholder, error)?;
        self.refresh();
        Some(failure)
    }

    /// Fail every speculative entry past its deadline.
    pub fn expire(&mut self, now: Instant) -> Vec<SendFailure> {
        let failures = self.outbox.expire(now);
        if !failures.is_empty() {
            self.refresh();
        }
        failures
    }

    fn refresh(&mut self) {
        let merged = merge(&self.history, &self.pushed, &self.outbox.entries());
        for r in &merged.reconciled {
            self.outbox.resolve(&r.placeholder);
            self.pin(&r.confirmed, r.seq, r.created_at);
            self.resolved
                .insert(r.placeholder.clone(), r.confirmed.clone());
        }
        self.view = merged.messages();
    }
}
