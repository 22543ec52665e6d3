//! Persistence collaborator interface.
//!
//! The engine never stores messages durably itself. It talks to an external
//! store through the [`PersistenceGateway`] trait: creates and status updates
//! go out as writes, the full conversation comes back through
//! [`query_all_messages`](PersistenceGateway::query_all_messages), and every
//! change (including the engine's own) is reported asynchronously on a
//! [`Subscription`].
//!
//! Implementations include:
//! - [`memory::InMemoryBackend`]: in-process backend with fault injection,
//!   used by the terminal binary and the test suites

pub mod memory;

use std::future::Future;

use tokio::sync::mpsc;

use fulcrum_proto::feed::FeedEvent;
use fulcrum_proto::message::{Message, MessageId, MessageStatus, Role};

/// Errors reported by a persistence write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The backend refused the write.
    #[error("write rejected: {0}")]
    Rejected(String),

    /// The backend could not be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The target row does not exist.
    #[error("message {0} not found")]
    NotFound(MessageId),
}

/// Errors that leave the engine without a live view of the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectivityError {
    /// Opening the change-feed subscription failed.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Loading the full conversation failed.
    #[error("load failed: {0}")]
    LoadFailed(String),
}

/// Async interface to the external message store.
///
/// The store assigns `id` and `created_at` on creation and is the source of
/// truth for every message's status. There is no optimistic concurrency
/// token: the last status write wins.
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Create a message and return it with its server-assigned fields.
    fn create_message(
        &self,
        role: Role,
        content: String,
        status: MessageStatus,
    ) -> impl Future<Output = Result<Message, WriteError>> + Send;

    /// Overwrite the status of an existing message.
    fn update_message_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> impl Future<Output = Result<(), WriteError>> + Send;

    /// Every message, ascending by `created_at`.
    fn query_all_messages(
        &self,
    ) -> impl Future<Output = Result<Vec<Message>, ConnectivityError>> + Send;

    /// Open a change-feed subscription.
    fn subscribe_to_changes(
        &self,
    ) -> impl Future<Output = Result<Subscription, ConnectivityError>> + Send;
}

/// A live change-feed subscription.
///
/// Yields [`FeedEvent`]s until the backend drops it. The teardown hook runs
/// exactly once, on [`unsubscribe`](Self::unsubscribe) or on drop, so a
/// forgotten subscription does not leak on the backend side.
pub struct Subscription {
    events: mpsc::Receiver<FeedEvent>,
    teardown: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wrap an event receiver and the backend's cleanup action.
    pub fn new(
        events: mpsc::Receiver<FeedEvent>,
        teardown: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            events,
            teardown: Some(Box::new(teardown)),
        }
    }

    /// Next change notification, or `None` once the subscription is lost.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    /// Tear the subscription down on the backend side.
    pub fn unsubscribe(mut self) {
        self.run_teardown();
    }

    fn run_teardown(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_teardown();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.teardown.is_some())
            .finish_non_exhaustive()
    }
}
