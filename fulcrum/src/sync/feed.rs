//! Change-feed listener.
//!
//! [`ChangeFeedListener`] keeps one subscription to the gateway's change feed
//! open and relays every record it carries to the merge loop, whatever the
//! `CREATE`/`MUTATE` tag says. It assumes nothing about delivery order and
//! buffers nothing: events missed while the subscription was down are
//! recovered by the full reload that follows every (re)subscription.
//!
//! Session lifecycle:
//!
//! ```text
//! Connecting ──subscribe──> reload ──> Connected ──stream ends──> Degraded
//!      ^                      │                                      │
//!      │                  load fails ──> Degraded ──────────────────┤
//!      └─────────────── subscribe fails ──> Degraded ──backoff──────┘
//! ```
//!
//! Every resubscription waits at least `initial_delay`. The delay only
//! drops back to `initial_delay` after a session that relayed at least one
//! event, so a feed that closes right after the handshake still backs off.
//!
//! The subscription is opened before the reload so that no change can fall
//! between the query and the first relayed event. Anything seen twice is
//! absorbed by the idempotent merge.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use fulcrum_proto::feed::FeedEvent;
use fulcrum_proto::message::Message;

use crate::persistence::{PersistenceGateway, Subscription};

use super::{Origin, ReconcileHandle, wait_for_shutdown};

/// Health of the listener's view of the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// First subscription not yet established.
    Connecting,
    /// Subscribed and resynchronized.
    Connected,
    /// Subscription lost or never loaded; retrying in the background.
    Degraded,
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Degraded => f.write_str("degraded"),
        }
    }
}

/// Backoff applied between failed (re)subscription attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResubscribeConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Growth factor applied after each further failure.
    pub multiplier: u32,
}

impl ResubscribeConfig {
    /// Delay to use after `current` failed again.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier.max(1))
            .min(self.max_delay)
    }
}

impl Default for ResubscribeConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
        }
    }
}

/// How a subscription session ended.
enum SessionEnd {
    /// The feed or the initial load failed; try again.
    ///
    /// `relayed` counts the feed events forwarded before the loss.
    Lost { relayed: usize },
    /// Shutdown was requested or the merge loop is gone.
    Stop,
}

/// Relays change-feed records from a [`PersistenceGateway`] to the merge loop.
pub struct ChangeFeedListener<G> {
    gateway: Arc<G>,
    merge: ReconcileHandle,
    connectivity: watch::Sender<Connectivity>,
    resubscribe: ResubscribeConfig,
}

impl<G: PersistenceGateway> ChangeFeedListener<G> {
    /// Create a listener and the receiver its connectivity is published on.
    ///
    /// Nothing happens until [`spawn`](Self::spawn) is called.
    #[must_use]
    pub fn new(
        gateway: Arc<G>,
        merge: ReconcileHandle,
        resubscribe: ResubscribeConfig,
    ) -> (Self, watch::Receiver<Connectivity>) {
        let (connectivity, rx) = watch::channel(Connectivity::Connecting);
        let listener = Self {
            gateway,
            merge,
            connectivity,
            resubscribe,
        };
        (listener, rx)
    }

    /// Run the listener on its own task until `shutdown` reads `true`.
    ///
    /// The live subscription, if any, is torn down before the task exits.
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut delay = self.resubscribe.initial_delay;

        loop {
            match self.session(&mut shutdown).await {
                SessionEnd::Stop => break,
                SessionEnd::Lost { relayed } => {
                    if relayed > 0 {
                        delay = self.resubscribe.initial_delay;
                    }
                    self.set_connectivity(Connectivity::Degraded);
                    tracing::debug!(?delay, "backing off before resubscribe");
                    tokio::select! {
                        biased;
                        () = wait_for_shutdown(&mut shutdown) => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                    delay = self.resubscribe.next_delay(delay);
                }
            }
        }

        tracing::debug!("change-feed listener stopped");
    }

    /// One subscribe, reload, relay cycle.
    async fn session(&self, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let subscription = tokio::select! {
            biased;
            () = wait_for_shutdown(shutdown) => return SessionEnd::Stop,
            result = self.gateway.subscribe_to_changes() => match result {
                Ok(subscription) => subscription,
                Err(e) => {
                    tracing::warn!(error = %e, "change-feed subscribe failed");
                    return SessionEnd::Lost { relayed: 0 };
                }
            },
        };

        let rows = tokio::select! {
            biased;
            () = wait_for_shutdown(shutdown) => {
                subscription.unsubscribe();
                return SessionEnd::Stop;
            }
            result = self.gateway.query_all_messages() => match result {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(error = %e, "resync load failed");
                    subscription.unsubscribe();
                    return SessionEnd::Lost { relayed: 0 };
                }
            },
        };

        let count = rows.len();
        if self.merge.reload(rows).await.is_err() {
            subscription.unsubscribe();
            return SessionEnd::Stop;
        }
        tracing::info!(rows = count, "change feed resynchronized");
        self.set_connectivity(Connectivity::Connected);

        self.relay(subscription, shutdown).await
    }

    /// Forward feed events until the stream ends or shutdown is requested.
    async fn relay(
        &self,
        mut subscription: Subscription,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut relayed = 0;
        loop {
            let event = tokio::select! {
                biased;
                () = wait_for_shutdown(shutdown) => {
                    subscription.unsubscribe();
                    return SessionEnd::Stop;
                }
                event = subscription.next() => event,
            };

            let Some(event) = event else {
                tracing::warn!(relayed, "change-feed subscription lost");
                return SessionEnd::Lost { relayed };
            };
            relayed += 1;

            let Some(record) = decode(event) else {
                continue;
            };
            if self.merge.apply(record, Origin::Feed).await.is_err() {
                subscription.unsubscribe();
                return SessionEnd::Stop;
            }
        }
    }

    fn set_connectivity(&self, next: Connectivity) {
        let changed = self.connectivity.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            tracing::info!(connectivity = %next, "connectivity changed");
        }
    }
}

/// Convert a feed event into a message, dropping malformed rows.
fn decode(event: FeedEvent) -> Option<Message> {
    let kind = event.kind;
    match Message::try_from(event.record) {
        Ok(message) => {
            tracing::trace!(message_id = %message.id, ?kind, "feed record received");
            Some(message)
        }
        Err(e) => {
            tracing::warn!(error = %e, ?kind, "malformed feed record dropped");
            None
        }
    }
}
