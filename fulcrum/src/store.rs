//! In-memory ordered conversation view.
//!
//! [`MessageStore`] holds at most one entry per [`MessageId`], kept sorted by
//! `created_at` with ties in insertion order. The only mutation is
//! [`upsert`](MessageStore::upsert); there is no deletion.

use fulcrum_proto::message::{Message, MessageId};

/// Ordered, id-unique collection of messages.
///
/// Not synchronized: the store is owned by the merge loop
/// ([`crate::sync::spawn_reconciler`]) and never shared across tasks.
#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    /// Messages sorted by `created_at`, ties in insertion order.
    messages: Vec<Message>,
}

impl MessageStore {
    /// Create a new, empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    /// Insert `record`, or replace the entry that has the same id.
    ///
    /// Returns the ordered snapshot after the change.
    pub fn upsert(&mut self, record: Message) -> &[Message] {
        match self.position(&record.id) {
            Some(idx) if self.messages[idx].created_at == record.created_at => {
                self.messages[idx] = record;
            }
            Some(idx) => {
                // created_at is not expected to change, but a row that moved
                // still has to land in order.
                self.messages.remove(idx);
                self.insert_sorted(record);
            }
            None => self.insert_sorted(record),
        }
        &self.messages
    }

    /// Current ordered messages.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Owned copy of the ordered messages, for publishing to readers.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Look up a message by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == *id)
    }

    /// Number of messages held.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store holds no messages.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == *id)
    }

    fn insert_sorted(&mut self, record: Message) {
        // partition_point places equal timestamps after existing ones, which
        // keeps ties in insertion order.
        let at = self
            .messages
            .partition_point(|m| m.created_at <= record.created_at);
        self.messages.insert(at, record);
    }
}
