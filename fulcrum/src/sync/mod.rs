//! Store ownership and reconciliation plumbing.
//!
//! The [`MessageStore`] is owned by a single merge loop task spawned with
//! [`spawn_reconciler`]. Every writer (the lifecycle coordinator applying
//! its own write results, and the [`feed::ChangeFeedListener`] relaying
//! change notifications) sends [`MergeInput`]s to that task through a
//! cloned [`ReconcileHandle`]. Because only the loop touches the store,
//! no lock is needed and both paths funnel through the same idempotent
//! [`merge::reconcile`].
//!
//! ```text
//! LifecycleCoordinator ──┐
//!                        ├── MergeInput ──> merge loop ──> watch<Vec<Message>>
//! ChangeFeedListener ────┘                      └───────> StoreEvent (mpsc)
//! ```

pub mod feed;
pub mod merge;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use fulcrum_proto::message::{Message, MessageId, MessageStatus};

use crate::store::MessageStore;

use merge::MergeOutcome;

/// Where a record handed to the merge loop came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Result of a write the coordinator issued itself.
    DirectWrite,
    /// A change-feed notification.
    Feed,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DirectWrite => f.write_str("direct"),
            Self::Feed => f.write_str("feed"),
        }
    }
}

/// Work item for the merge loop.
#[derive(Debug)]
pub enum MergeInput {
    /// Reconcile a single record.
    Record {
        /// The incoming record.
        record: Message,
        /// Which path delivered it.
        origin: Origin,
    },
    /// Reconcile every row of a full reload.
    Reload(Vec<Message>),
    /// Reply once every earlier input has been applied.
    Flush(oneshot::Sender<()>),
}

/// Store changes emitted for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A message appeared in the store.
    Inserted(Message),
    /// A stored message moved to a new status.
    StatusChanged {
        /// The message whose status changed.
        message_id: MessageId,
        /// Previous status.
        from: MessageStatus,
        /// New status.
        to: MessageStatus,
    },
}

/// The merge loop has stopped and no longer accepts input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("reconciler has shut down")]
pub struct ReconcilerClosed;

/// Cloneable handle for feeding records to the merge loop and reading the
/// published snapshot.
#[derive(Debug, Clone)]
pub struct ReconcileHandle {
    tx: mpsc::Sender<MergeInput>,
    snapshot: watch::Receiver<Vec<Message>>,
}

impl ReconcileHandle {
    /// Queue a record for reconciliation.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcilerClosed`] if the merge loop has exited.
    pub async fn apply(&self, record: Message, origin: Origin) -> Result<(), ReconcilerClosed> {
        self.tx
            .send(MergeInput::Record { record, origin })
            .await
            .map_err(|_| ReconcilerClosed)
    }

    /// Queue the rows of a full reload.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcilerClosed`] if the merge loop has exited.
    pub async fn reload(&self, records: Vec<Message>) -> Result<(), ReconcilerClosed> {
        self.tx
            .send(MergeInput::Reload(records))
            .await
            .map_err(|_| ReconcilerClosed)
    }

    /// Wait until every input queued before this call has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcilerClosed`] if the merge loop has exited.
    pub async fn flush(&self) -> Result<(), ReconcilerClosed> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(MergeInput::Flush(done_tx))
            .await
            .map_err(|_| ReconcilerClosed)?;
        done_rx.await.map_err(|_| ReconcilerClosed)
    }

    /// Current ordered snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.snapshot.borrow().clone()
    }

    /// A receiver that is notified whenever the snapshot changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.snapshot.clone()
    }
}

/// Spawn the merge loop that owns the [`MessageStore`].
///
/// Returns the handle writers use, a receiver for [`StoreEvent`]s, and the
/// loop's join handle. The loop exits when `shutdown` flips to `true` or
/// every [`ReconcileHandle`] has been dropped.
#[must_use]
pub fn spawn_reconciler(
    capacity: usize,
    event_buffer: usize,
    shutdown: watch::Receiver<bool>,
) -> (
    ReconcileHandle,
    mpsc::Receiver<StoreEvent>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::channel(capacity);
    let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());
    let (event_tx, event_rx) = mpsc::channel(event_buffer);

    let task = tokio::spawn(merge_loop(rx, snapshot_tx, event_tx, shutdown));

    let handle = ReconcileHandle {
        tx,
        snapshot: snapshot_rx,
    };
    (handle, event_rx, task)
}

/// Resolves once `shutdown` reads `true`. A dropped sender counts as a
/// shutdown request.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn merge_loop(
    mut rx: mpsc::Receiver<MergeInput>,
    snapshot_tx: watch::Sender<Vec<Message>>,
    event_tx: mpsc::Sender<StoreEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut store = MessageStore::new();

    loop {
        let input = tokio::select! {
            biased;
            () = wait_for_shutdown(&mut shutdown) => break,
            input = rx.recv() => match input {
                Some(input) => input,
                None => break,
            },
        };

        let changed = match input {
            MergeInput::Record { record, origin } => {
                let message_id = record.id.clone();
                let outcome = merge::reconcile(&mut store, record);
                emit(&store, &message_id, outcome, origin, &event_tx);
                outcome.changed()
            }
            MergeInput::Reload(records) => {
                let total = records.len();
                let changed = merge::reconcile_all(&mut store, records, |store, id, outcome| {
                    emit(store, id, outcome, Origin::Feed, &event_tx);
                });
                tracing::info!(rows = total, changed, "reload reconciled");
                changed > 0
            }
            MergeInput::Flush(done) => {
                let _ = done.send(());
                false
            }
        };

        if changed {
            snapshot_tx.send_replace(store.snapshot());
        }
    }

    tracing::debug!(messages = store.len(), "merge loop stopped");
}

/// Emit the [`StoreEvent`] matching a merge outcome, if it has one.
fn emit(
    store: &MessageStore,
    message_id: &MessageId,
    outcome: MergeOutcome,
    origin: Origin,
    event_tx: &mpsc::Sender<StoreEvent>,
) {
    let event = match outcome {
        MergeOutcome::Inserted => store.get(message_id).cloned().map(StoreEvent::Inserted),
        MergeOutcome::Replaced { from, to } if from != to => Some(StoreEvent::StatusChanged {
            message_id: message_id.clone(),
            from,
            to,
        }),
        MergeOutcome::Replaced { .. } => None,
        MergeOutcome::Unchanged => {
            tracing::trace!(%message_id, %origin, "duplicate record ignored");
            None
        }
        MergeOutcome::Stale { current, incoming } => {
            tracing::debug!(%message_id, %origin, %current, %incoming, "stale record discarded");
            None
        }
    };

    let Some(event) = event else {
        return;
    };
    // Best-effort: a UI that stopped draining events must not stall merging.
    match event_tx.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => {
            tracing::debug!(?event, "store event buffer full, event dropped");
        }
    }
}
