//! Engine wiring.
//!
//! [`Engine::init`] spawns the background tasks and hands the UI one object
//! to drive them through:
//!
//! ```text
//!                      ┌── ChangeFeedListener ──┐
//! PersistenceGateway ──┤                        ├── MergeInput ──> merge loop
//!                      └── LifecycleCoordinator ┘                    │
//!        UI <── snapshot (watch) / StoreEvent (mpsc) ────────────────┘
//! ```
//!
//! All tasks share one shutdown signal; [`Engine::teardown`] raises it and
//! waits for them to stop.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use fulcrum_proto::message::Message;

use crate::chat::delay::DelayStrategy;
use crate::chat::{ExchangeHandle, LifecycleCoordinator, SendRejected};
use crate::persistence::PersistenceGateway;
use crate::sync::feed::{ChangeFeedListener, Connectivity, ResubscribeConfig};
use crate::sync::{ReconcileHandle, StoreEvent, spawn_reconciler};

/// Default capacity of the merge loop's input channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default capacity of the [`StoreEvent`] channel.
const DEFAULT_EVENT_BUFFER: usize = 64;

/// Sizing and retry settings for the engine's tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Capacity of the merge loop's input channel.
    pub channel_capacity: usize,
    /// Capacity of the [`StoreEvent`] channel handed to the UI.
    pub event_buffer: usize,
    /// Backoff between failed feed subscriptions.
    pub resubscribe: ResubscribeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            event_buffer: DEFAULT_EVENT_BUFFER,
            resubscribe: ResubscribeConfig::default(),
        }
    }
}

/// A running chat engine.
///
/// Dropping the engine signals shutdown without waiting; prefer
/// [`teardown`](Self::teardown).
pub struct Engine<G, D> {
    coordinator: Arc<LifecycleCoordinator<G, D>>,
    merge: ReconcileHandle,
    connectivity: watch::Receiver<Connectivity>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl<G: PersistenceGateway, D: DelayStrategy> Engine<G, D> {
    /// Spawn the merge loop and the change-feed listener.
    ///
    /// Must be called from within a tokio runtime. Returns the engine and
    /// the receiver for [`StoreEvent`]s, which the UI should drain.
    #[must_use]
    pub fn init(
        gateway: Arc<G>,
        config: EngineConfig,
        delays: D,
    ) -> (Self, mpsc::Receiver<StoreEvent>) {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let (merge, events, merge_task) =
            spawn_reconciler(config.channel_capacity, config.event_buffer, shutdown_rx.clone());

        let (listener, connectivity) =
            ChangeFeedListener::new(Arc::clone(&gateway), merge.clone(), config.resubscribe);
        let listener_task = listener.spawn(shutdown_rx);

        let coordinator = Arc::new(LifecycleCoordinator::new(gateway, merge.clone(), delays));

        tracing::info!(
            channel_capacity = config.channel_capacity,
            event_buffer = config.event_buffer,
            "engine started"
        );

        let engine = Self {
            coordinator,
            merge,
            connectivity,
            shutdown,
            tasks: vec![merge_task, listener_task],
        };
        (engine, events)
    }

    /// Start an exchange. See [`LifecycleCoordinator::send_message`].
    ///
    /// # Errors
    ///
    /// Returns [`SendRejected`] if the text is empty or too large, or an
    /// exchange is already in flight.
    pub fn send_message(&self, text: &str) -> Result<ExchangeHandle, SendRejected> {
        self.coordinator.send_message(text)
    }

    /// Current ordered conversation.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.merge.snapshot()
    }

    /// A receiver notified whenever the conversation changes.
    #[must_use]
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Vec<Message>> {
        self.merge.subscribe()
    }

    /// Current connectivity of the change feed.
    #[must_use]
    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    /// A receiver notified whenever connectivity changes.
    #[must_use]
    pub fn subscribe_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.clone()
    }

    /// Whether an exchange is in flight.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.coordinator.is_processing()
    }

    /// A receiver notified whenever the in-flight flag flips.
    #[must_use]
    pub fn subscribe_processing(&self) -> watch::Receiver<bool> {
        self.coordinator.subscribe_processing()
    }

    /// Stop the listener and the merge loop and wait for both.
    ///
    /// An exchange still running afterwards fails with
    /// [`ExchangeError::ReconcilerClosed`](crate::chat::ExchangeError::ReconcilerClosed)
    /// at its next local update.
    pub async fn teardown(mut self) {
        self.shutdown.send_replace(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "engine task ended abnormally");
            }
        }
        tracing::info!("engine stopped");
    }
}

impl<G, D> Drop for Engine<G, D> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
