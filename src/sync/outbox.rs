//! Optimistic write buffer: speculative sends awaiting confirmation.

use std::time::Duration;

use tokio::time::Instant;

use super::merge::Entry;
use crate::error::SyncError;
use crate::models::{Message, MessageId, MessageStatus};

/// A speculative send that failed and was removed from the sequence.
///
/// Carries the body so the caller can offer a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub placeholder: MessageId,
    pub body: String,
    pub error: SyncError,
}

struct PendingSend {
    entry: Entry,
    deadline: Instant,
}

/// Pending entries of one conversation, each with its own deadline.
pub struct Outbox {
    pending: Vec<PendingSend>,
    timeout: Duration,
}

impl Outbox {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Vec::new(),
            timeout,
        }
    }

    /// Add a speculative entry. At most one identical entry may be pending.
    pub fn stage(&mut self, entry: Entry, now: Instant) -> Result<(), SyncError> {
        if entry.message.body.trim().is_empty() {
            return Err(SyncError::EmptyBody);
        }
        if let Some(existing) = self
            .pending
            .iter()
            .find(|p| p.entry.message.same_content(&entry.message))
        {
            return Err(SyncError::DuplicatePending(existing.entry.message.id.clone()));
        }

        let mut entry = entry;
        entry.message.status = MessageStatus::Pending;
        self.pending.push(PendingSend {
            entry,
            deadline: now + self.timeout,
        });
        Ok(())
    }

    /// Snapshot of pending entries, as merge input.
    pub fn entries(&self) -> Vec<Entry> {
        self.pending.iter().map(|p| p.entry.clone()).collect()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.pending
            .iter()
            .find(|p| &p.entry.message.id == id)
            .map(|p| &p.entry.message)
    }

    /// Remove a confirmed entry. Its timer goes with it.
    pub fn resolve(&mut self, id: &MessageId) -> Option<Entry> {
        let pos = self.pending.iter().position(|p| &p.entry.message.id == id)?;
        Some(self.pending.remove(pos).entry)
    }

    /// Remove an entry whose send failed.
    pub fn fail(&mut self, id: &MessageId, error: SyncError) -> Option<SendFailure> {
        let entry = self.resolve(id)?;
        Some(SendFailure {
            placeholder: entry.message.id,
            body: entry.message.body,
            error,
        })
    }

    /// Fail every entry whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<SendFailure> {
        let timeout = self.timeout;
        let (expired, alive): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|p| p.deadline <= now);
        self.pending = alive;
        expired
            .into_iter()
            .map(|p| SendFailure {
                error: SyncError::SendTimeout {
                    placeholder: p.entry.message.id.clone(),
                    timeout,
                },
                placeholder: p.entry.message.id,
                body: p.entry.message.body,
            })
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Participant, Role};
    use crate::room::ConversationKey;
    use chrono::Utc;

    fn pending(n: u64, body: &str) -> Entry {
        Entry::new(
            n,
            Message {
                id: MessageId::Placeholder(n),
                conversation_key: ConversationKey::derive(&["p1", "p2"], None).unwrap(),
                sender: Participant::new("p1", "Pat", Role::Patient),
                body: body.to_string(),
                created_at: Utc::now(),
                scope_token: None,
                status: MessageStatus::Pending,
            },
        )
    }

    #[test]
    fn test_identical_pending_rejected_until_resolved() {
        let now = Instant::now();
        let mut outbox = Outbox::new(Duration::from_secs(10));
        outbox.stage(pending(1, "hello"), now).unwrap();
        assert_eq!(
            outbox.stage(pending(2, "hello"), now),
            Err(SyncError::DuplicatePending(MessageId::Placeholder(1)))
        );

        assert!(outbox.resolve(&MessageId::Placeholder(1)).is_some());
        outbox.stage(pending(2, "hello"), now).unwrap();
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_empty_body_rejected() {
        let mut outbox = Outbox::new(Duration::from_secs(10));
        assert_eq!(
            outbox.stage(pending(1, "  "), Instant::now()),
            Err(SyncError::EmptyBody)
        );
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_expire_only_past_deadline() {
        let start = Instant::now();
        let mut outbox = Outbox::new(Duration::from_secs(10));
        outbox.stage(pending(1, "first"), start).unwrap();
        outbox
            .stage(pending(2, "second"), start + Duration::from_secs(5))
            .unwrap();
        assert_eq!(outbox.next_deadline(), Some(start + Duration::from_secs(10)));

        assert!(outbox.expire(start + Duration::from_secs(9)).is_empty());

        let failed = outbox.expire(start + Duration::from_secs(10));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].body, "first");
        assert!(matches!(failed[0].error, SyncError::SendTimeout { .. }));
        assert_eq!(outbox.next_deadline(), Some(start + Duration::from_secs(15)));
    }

    #[test]
    fn test_resolved_entry_never_expires() {
        let start = Instant::now();
        let mut outbox = Outbox::new(Duration::from_secs(1));
        outbox.stage(pending(1, "hi"), start).unwrap();
        outbox.resolve(&MessageId::Placeholder(1));
        assert!(outbox.expire(start + Duration::from_secs(60)).is_empty());
        assert_eq!(outbox.next_deadline(), None);
        assert!(outbox.fail(&MessageId::Placeholder(1), SyncError::EmptyBody).is_none());
    }
}
