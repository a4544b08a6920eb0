//! Merge and ordering of history, pushed and speculative entries.
//!
//! `merge` is a pure function of its three inputs. Callers re-run it whenever
//! any input changes and apply the returned reconciliations to their buffers.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::models::{Message, MessageId};

/// A message plus its conversation-local insertion sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub seq: u64,
    pub message: Message,
}

impl Entry {
    pub fn new(seq: u64, message: Message) -> Self {
        Self { seq, message }
    }

    fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.message.created_at, self.seq)
    }
}

/// A speculative entry confirmed by content during a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub placeholder: MessageId,
    pub confirmed: MessageId,
    /// Position inherited from the placeholder.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

/// Output of a merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Merged {
    pub entries: Vec<Entry>,
    pub reconciled: Vec<Reconciled>,
}

impl Merged {
    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }
}

/// Combine the three sources into one ordered, duplicate-free sequence.
///
/// 1. Dedup authoritative entries by id; history wins over pushed.
/// 2. Reconcile pending entries by content (sender, body, scope) against
///    authoritative entries inserted after them. A matched entry takes over
///    the placeholder's position.
/// 3. Sort by `created_at`, ties broken by insertion sequence.
pub fn merge(history: &[Entry], pushed: &[Entry], optimistic: &[Entry]) -> Merged {
    let mut seen: HashSet<&MessageId> = HashSet::new();
    let mut confirmed: Vec<Entry> = Vec::with_capacity(history.len() + pushed.len());
    for entry in history.iter().chain(pushed) {
        if entry.message.id.is_placeholder() {
            continue;
        }
        if seen.insert(&entry.message.id) {
            confirmed.push(entry.clone());
        }
    }

    let mut pending: Vec<&Entry> = optimistic
        .iter()
        .filter(|e| e.message.is_pending())
        .collect();
    pending.sort_by_key(|e| e.seq);

    let mut claimed = vec![false; confirmed.len()];
    let mut reconciled = Vec::new();
    let mut unmatched = Vec::new();
    for placeholder in pending {
        let hit = confirmed
            .iter()
            .enumerate()
            .filter(|(i, c)| {
                !claimed[*i]
                    && c.seq > placeholder.seq
                    && c.message.same_content(&placeholder.message)
            })
            .min_by_key(|(_, c)| c.seq)
            .map(|(i, _)| i);

        match hit {
            Some(i) => {
                claimed[i] = true;
                let entry = &mut confirmed[i];
                entry.seq = placeholder.seq;
                entry.message.created_at = placeholder.message.created_at;
                reconciled.push(Reconciled {
                    placeholder: placeholder.message.id.clone(),
                    confirmed: entry.message.id.clone(),
                    seq: placeholder.seq,
                    created_at: placeholder.message.created_at,
                });
            }
            None => unmatched.push(placeholder.clone()),
        }
    }

    let mut entries = confirmed;
    entries.extend(unmatched);
    entries.sort_by_key(Entry::sort_key);

    Merged {
        entries,
        reconciled,
    }
}
