//! In-process persistence backend.
//!
//! [`InMemoryBackend`] plays the role of the external store: it assigns ids
//! and strictly increasing `created_at` values, keeps rows in creation order,
//! and fans every change out to its subscribers as a [`FeedEvent`]. It is
//! cheap to clone; clones share the same table.
//!
//! Fault hooks let tests and the demo binary exercise the engine's failure
//! paths: failing specific writes, failing subscribe or query calls,
//! duplicating feed delivery, and dropping every live subscription.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use fulcrum_proto::feed::{ChangeKind, FeedEvent};
use fulcrum_proto::message::{Message, MessageId, MessageStatus, Role, Timestamp};

use super::{ConnectivityError, PersistenceGateway, Subscription, WriteError};

/// Default per-subscriber feed buffer.
const DEFAULT_FEED_BUFFER: usize = 256;

/// Faults armed for upcoming calls.
#[derive(Debug, Default)]
struct Faults {
    /// Fail the next create for this role.
    create: Option<Role>,
    /// Fail the next update to this status.
    status_update: Option<MessageStatus>,
    /// Number of upcoming subscribe calls to fail.
    subscribes: usize,
    /// Number of upcoming queries to fail.
    queries: usize,
    /// Deliver every feed event twice.
    duplicate_delivery: bool,
}

#[derive(Debug, Default)]
struct BackendState {
    /// Rows in creation order (and therefore `created_at` order).
    rows: Vec<Message>,
    /// Last assigned `created_at`, in milliseconds.
    last_created_ms: u64,
    /// Live subscriber channels keyed by subscription number.
    subscribers: HashMap<u64, mpsc::Sender<FeedEvent>>,
    next_subscription: u64,
    faults: Faults,
}

impl BackendState {
    /// Strictly increasing creation time, tracking the wall clock.
    fn next_created_at(&mut self) -> Timestamp {
        let now = Timestamp::now().as_millis();
        self.last_created_ms = now.max(self.last_created_ms + 1);
        Timestamp::from_millis(self.last_created_ms)
    }

    fn publish(&mut self, kind: ChangeKind, msg: &Message) {
        let event = FeedEvent::new(kind, msg);
        let copies = if self.faults.duplicate_delivery { 2 } else { 1 };

        self.subscribers.retain(|id, tx| {
            for _ in 0..copies {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // The feed does not buffer for slow consumers; the
                        // resync on resubscribe closes the gap.
                        tracing::warn!(subscription = id, message_id = %msg.id, "feed buffer full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
    }
}

/// In-memory implementation of [`PersistenceGateway`].
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
    feed_buffer: usize,
}

impl InMemoryBackend {
    /// Create an empty backend with the default feed buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_feed_buffer(DEFAULT_FEED_BUFFER)
    }

    /// Create an empty backend whose subscriptions buffer `feed_buffer`
    /// events each.
    #[must_use]
    pub fn with_feed_buffer(feed_buffer: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState::default())),
            feed_buffer,
        }
    }

    /// Copy of every stored row, in creation order.
    #[must_use]
    pub fn rows(&self) -> Vec<Message> {
        self.state.lock().rows.clone()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Make the next create for `role` fail.
    pub fn fail_next_create(&self, role: Role) {
        self.state.lock().faults.create = Some(role);
    }

    /// Make the next update to `status` fail.
    pub fn fail_next_status_update(&self, status: MessageStatus) {
        self.state.lock().faults.status_update = Some(status);
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_subscribes(&self, count: usize) {
        self.state.lock().faults.subscribes = count;
    }

    /// Make the next `count` queries fail.
    pub fn fail_queries(&self, count: usize) {
        self.state.lock().faults.queries = count;
    }

    /// Deliver every feed event twice (at-least-once delivery).
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.state.lock().faults.duplicate_delivery = enabled;
    }

    /// Close every live subscription, as a lost connection would.
    pub fn drop_subscriptions(&self) {
        let dropped = {
            let mut state = self.state.lock();
            let count = state.subscribers.len();
            state.subscribers.clear();
            count
        };
        tracing::info!(dropped, "dropped all feed subscriptions");
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceGateway for InMemoryBackend {
    async fn create_message(
        &self,
        role: Role,
        content: String,
        status: MessageStatus,
    ) -> Result<Message, WriteError> {
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        if state.faults.create == Some(role) {
            state.faults.create = None;
            return Err(WriteError::Unavailable(format!("injected {role} create failure")));
        }

        let msg = Message {
            id: MessageId::new(),
            role,
            content,
            status,
            created_at: state.next_created_at(),
        };
        state.rows.push(msg.clone());
        state.publish(ChangeKind::Create, &msg);
        drop(state);

        tracing::debug!(message_id = %msg.id, %role, %status, "row created");
        Ok(msg)
    }

    async fn update_message_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<(), WriteError> {
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        if state.faults.status_update == Some(status) {
            state.faults.status_update = None;
            return Err(WriteError::Unavailable(format!(
                "injected {status} update failure"
            )));
        }

        let Some(row) = state.rows.iter_mut().find(|m| m.id == *id) else {
            return Err(WriteError::NotFound(id.clone()));
        };
        row.status = status;
        let updated = row.clone();
        state.publish(ChangeKind::Mutate, &updated);
        drop(state);

        tracing::debug!(message_id = %id, %status, "row updated");
        Ok(())
    }

    async fn query_all_messages(&self) -> Result<Vec<Message>, ConnectivityError> {
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        if state.faults.queries > 0 {
            state.faults.queries -= 1;
            return Err(ConnectivityError::LoadFailed("injected query failure".into()));
        }
        Ok(state.rows.clone())
    }

    async fn subscribe_to_changes(&self) -> Result<Subscription, ConnectivityError> {
        tokio::task::yield_now().await;

        let (tx, rx) = mpsc::channel(self.feed_buffer);
        let id = {
            let mut state = self.state.lock();
            if state.faults.subscribes > 0 {
                state.faults.subscribes -= 1;
                return Err(ConnectivityError::SubscribeFailed(
                    "injected subscribe failure".into(),
                ));
            }
            let id = state.next_subscription;
            state.next_subscription += 1;
            state.subscribers.insert(id, tx);
            id
        };

        let shared = Arc::downgrade(&self.state);
        Ok(Subscription::new(rx, move || {
            if let Some(state) = shared.upgrade() {
                state.lock().subscribers.remove(&id);
            }
        }))
    }
}
