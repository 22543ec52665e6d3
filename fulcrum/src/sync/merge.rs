//! Reconciliation of incoming message records into the [`MessageStore`].
//!
//! The external store is the source of truth, so a known message is
//! overwritten wholesale by the incoming record rather than merged field by
//! field. The one exception is a record whose status would move the message
//! backward in the lifecycle graph: that record is an older write delivered
//! late (for example the feed's `CREATE` arriving after the coordinator
//! already applied the follow-up `sent`), and applying it would regress the
//! message.
//!
//! Rules, in order:
//! 1. Unknown id: insert.
//! 2. Identical record: no change.
//! 3. Incoming status ranks below the stored one: discard as stale.
//! 4. Otherwise: overwrite.

use fulcrum_proto::message::{Message, MessageId, MessageStatus};

use crate::store::MessageStore;

/// What [`reconcile`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The id was new and the record was added.
    Inserted,
    /// An existing entry was overwritten.
    Replaced {
        /// Status before the overwrite.
        from: MessageStatus,
        /// Status after the overwrite.
        to: MessageStatus,
    },
    /// The record matched the stored entry exactly.
    Unchanged,
    /// The record would have regressed the stored status and was dropped.
    Stale {
        /// Status kept in the store.
        current: MessageStatus,
        /// Status carried by the discarded record.
        incoming: MessageStatus,
    },
}

impl MergeOutcome {
    /// Whether the store contents changed.
    #[must_use]
    pub const fn changed(&self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced { .. })
    }
}

/// Applies one incoming record to the store.
pub fn reconcile(store: &mut MessageStore, incoming: Message) -> MergeOutcome {
    let Some(existing) = store.get(&incoming.id) else {
        store.upsert(incoming);
        return MergeOutcome::Inserted;
    };

    if *existing == incoming {
        return MergeOutcome::Unchanged;
    }

    let current = existing.status;
    if !current.can_advance_to(incoming.status) {
        return MergeOutcome::Stale {
            current,
            incoming: incoming.status,
        };
    }

    let to = incoming.status;
    store.upsert(incoming);
    MergeOutcome::Replaced { from: current, to }
}

/// Applies a batch of records (a full reload) in order and returns how many
/// changed the store.
///
/// `observe` sees the store right after each record, with that record's id
/// and outcome.
pub fn reconcile_all<I, F>(store: &mut MessageStore, records: I, mut observe: F) -> usize
where
    I: IntoIterator<Item = Message>,
    F: FnMut(&MessageStore, &MessageId, MergeOutcome),
{
    let mut changed = 0;
    for record in records {
        let id = record.id.clone();
        let outcome = reconcile(store, record);
        if outcome.changed() {
            changed += 1;
        }
        observe(store, &id, outcome);
    }
    changed
}
