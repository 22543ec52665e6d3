//! Property-based reconciliation tests.
//!
//! Uses proptest to verify:
//! 1. Any sequence of records leaves at most one entry per id.
//! 2. The store is always ordered by `created_at`.
//! 3. Re-applying a sequence that was already applied changes nothing.
//! 4. Direct-write and feed copies of an exchange's records converge to the
//!    terminal states whatever order they arrive in.

use proptest::prelude::*;
use std::collections::HashSet;

use fulcrum::store::MessageStore;
use fulcrum::sync::merge::{MergeOutcome, reconcile, reconcile_all};
use fulcrum_proto::message::{Message, MessageId, MessageStatus, Role, Timestamp};
use uuid::Uuid;

// --- Strategies ---

fn arb_status() -> impl Strategy<Value = MessageStatus> {
    prop_oneof![
        Just(MessageStatus::Sending),
        Just(MessageStatus::Sent),
        Just(MessageStatus::Processing),
        Just(MessageStatus::Completed),
        Just(MessageStatus::Error),
    ]
}

fn arb_role() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::User), Just(Role::Assistant)]
}

/// A record drawn from a small id pool so sequences revisit ids.
///
/// `created_at` is derived from the id (the store assigns it once), with a
/// small modulus so ties are common.
fn arb_record() -> impl Strategy<Value = Message> {
    (0u128..8, arb_role(), arb_status(), "[a-z]{0,8}").prop_map(|(n, role, status, content)| {
        Message {
            id: MessageId::from_uuid(Uuid::from_u128(n)),
            role,
            content,
            status,
            created_at: Timestamp::from_millis(u64::try_from(n % 3).unwrap_or(0)),
        }
    })
}

fn apply_all(records: &[Message]) -> MessageStore {
    let mut store = MessageStore::new();
    reconcile_all(&mut store, records.iter().cloned(), |_, _, _| {});
    store
}

fn lifecycle(n: u128, role: Role, statuses: [MessageStatus; 2], ts: u64) -> Vec<Message> {
    let base = Message {
        id: MessageId::from_uuid(Uuid::from_u128(n)),
        role,
        content: format!("message {n}"),
        status: statuses[0],
        created_at: Timestamp::from_millis(ts),
    };
    statuses.iter().map(|s| base.with_status(*s)).collect()
}

// --- Properties ---

proptest! {
    #[test]
    fn never_duplicates_an_id(records in prop::collection::vec(arb_record(), 0..64)) {
        let store = apply_all(&records);

        let distinct: HashSet<&MessageId> = records.iter().map(|m| &m.id).collect();
        prop_assert_eq!(store.len(), distinct.len());

        let stored: HashSet<&MessageId> = store.messages().iter().map(|m| &m.id).collect();
        prop_assert_eq!(stored.len(), store.len());
    }

    #[test]
    fn snapshot_is_ordered(records in prop::collection::vec(arb_record(), 0..64)) {
        let store = apply_all(&records);
        let snapshot = store.snapshot();
        prop_assert!(snapshot.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn reapplying_a_sequence_is_a_no_op(records in prop::collection::vec(arb_record(), 0..64)) {
        let mut store = apply_all(&records);
        let before = store.snapshot();

        reconcile_all(&mut store, records.iter().cloned(), |_, _, _| {});
        prop_assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn same_record_twice_is_unchanged(record in arb_record()) {
        let mut store = MessageStore::new();
        prop_assert_eq!(reconcile(&mut store, record.clone()), MergeOutcome::Inserted);
        prop_assert_eq!(reconcile(&mut store, record), MergeOutcome::Unchanged);
    }

    #[test]
    fn status_never_moves_backward(records in prop::collection::vec(arb_record(), 1..64)) {
        let mut store = MessageStore::new();
        for record in records {
            let before = store.get(&record.id).map(|m| m.status.rank());
            reconcile(&mut store, record.clone());
            let after = store.get(&record.id).map(|m| m.status.rank());
            prop_assert!(after >= before);
        }
    }

    #[test]
    fn exchange_converges_under_any_interleaving(
        order in Just({
            let user = lifecycle(1, Role::User, [MessageStatus::Sending, MessageStatus::Sent], 100);
            let assistant = lifecycle(
                2,
                Role::Assistant,
                [MessageStatus::Processing, MessageStatus::Completed],
                101,
            );
            // Every record arrives twice: once as a direct write, once on the feed.
            let mut all = Vec::new();
            for record in user.into_iter().chain(assistant) {
                all.push(record.clone());
                all.push(record);
            }
            all
        }).prop_shuffle()
    ) {
        let store = apply_all(&order);
        let snapshot = store.snapshot();

        prop_assert_eq!(snapshot.len(), 2);
        prop_assert_eq!(snapshot[0].role, Role::User);
        prop_assert_eq!(snapshot[0].status, MessageStatus::Sent);
        prop_assert_eq!(snapshot[1].role, Role::Assistant);
        prop_assert_eq!(snapshot[1].status, MessageStatus::Completed);
    }

    #[test]
    fn error_wins_over_any_interleaving(
        order in Just(
            lifecycle(3, Role::User, [MessageStatus::Sending, MessageStatus::Error], 100)
        ).prop_shuffle()
    ) {
        let store = apply_all(&order);
        prop_assert_eq!(store.messages()[0].status, MessageStatus::Error);
    }
}
