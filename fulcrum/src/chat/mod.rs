//! Exchange lifecycle for the Fulcrum chat engine.
//!
//! Contains the [`LifecycleCoordinator`], which drives one user/assistant
//! exchange through its four persistence writes:
//!
//! ```text
//! create user (sending) -> ack delay -> user sent
//!   -> create assistant (processing) -> think time -> assistant completed
//! ```
//!
//! Every successful write result is handed to the merge loop as a
//! [`Origin::DirectWrite`] record, so the local view advances even before
//! the change feed echoes the write. Only one exchange runs at a time.

pub mod delay;
pub mod responses;

use std::sync::Arc;

use tokio::sync::watch;

use fulcrum_proto::message::{
    Message, MessageId, MessageStatus, Role, ValidationError, validate_content,
};

use crate::persistence::{PersistenceGateway, WriteError};
use crate::sync::{Origin, ReconcileHandle, ReconcilerClosed};

use delay::DelayStrategy;

/// Reasons a send is refused before any write is issued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendRejected {
    /// The text was empty after trimming.
    #[error("message is empty")]
    EmptyText,

    /// Another exchange is still running.
    #[error("an exchange is already in flight")]
    ExchangeInFlight,

    /// The text exceeds the maximum message size.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    TooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

impl From<ValidationError> for SendRejected {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Empty => Self::EmptyText,
            ValidationError::TooLarge { size, max } => Self::TooLarge { size, max },
        }
    }
}

/// The write an exchange was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStep {
    /// Creating the user message.
    CreateUser,
    /// Marking the user message `sent`.
    MarkSent,
    /// Creating the assistant message.
    CreateAssistant,
    /// Marking the assistant message `completed`.
    MarkCompleted,
}

impl std::fmt::Display for ExchangeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CreateUser => "create user message",
            Self::MarkSent => "mark user message sent",
            Self::CreateAssistant => "create assistant message",
            Self::MarkCompleted => "mark assistant message completed",
        };
        f.write_str(s)
    }
}

/// Errors that end an accepted exchange early.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// A persistence write failed; the remaining steps were skipped.
    #[error("{step} failed: {source}")]
    Write {
        /// The step that failed.
        step: ExchangeStep,
        /// The gateway's error.
        #[source]
        source: WriteError,
    },

    /// The merge loop shut down mid-exchange.
    #[error(transparent)]
    ReconcilerClosed(#[from] ReconcilerClosed),

    /// The exchange task was cancelled or panicked.
    #[error("exchange task aborted")]
    Aborted,
}

/// Ids of the two messages a completed exchange produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeReport {
    /// The user message, now `sent`.
    pub user_id: MessageId,
    /// The assistant message, now `completed`.
    pub assistant_id: MessageId,
}

/// Handle to an accepted exchange running in the background.
#[derive(Debug)]
pub struct ExchangeHandle {
    task: tokio::task::JoinHandle<Result<ExchangeReport, ExchangeError>>,
}

impl ExchangeHandle {
    /// Wait for the exchange to finish.
    ///
    /// # Errors
    ///
    /// Returns the [`ExchangeError`] that ended the exchange, or
    /// [`ExchangeError::Aborted`] if its task did not run to completion.
    pub async fn outcome(self) -> Result<ExchangeReport, ExchangeError> {
        self.task.await.unwrap_or(Err(ExchangeError::Aborted))
    }
}

/// Holds the single-exchange slot; frees it on drop.
struct InFlight {
    flag: Arc<watch::Sender<bool>>,
}

impl InFlight {
    fn try_acquire(flag: &Arc<watch::Sender<bool>>) -> Option<Self> {
        let acquired = flag.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        acquired.then(|| Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.flag.send_replace(false);
    }
}

/// Runs user/assistant exchanges against a [`PersistenceGateway`].
///
/// Each write goes to the gateway first; its result is then reconciled
/// locally. A failed write aborts the exchange without retry and, for a
/// status write, moves the affected message to `error`.
pub struct LifecycleCoordinator<G, D> {
    gateway: Arc<G>,
    merge: ReconcileHandle,
    delays: D,
    processing: Arc<watch::Sender<bool>>,
}

impl<G: PersistenceGateway, D: DelayStrategy> LifecycleCoordinator<G, D> {
    /// Create a coordinator writing through `gateway` and reconciling into
    /// `merge`.
    #[must_use]
    pub fn new(gateway: Arc<G>, merge: ReconcileHandle, delays: D) -> Self {
        let (processing, _) = watch::channel(false);
        Self {
            gateway,
            merge,
            delays,
            processing: Arc::new(processing),
        }
    }

    /// Start an exchange for `text`.
    ///
    /// The text is trimmed before it is stored. On acceptance the exchange
    /// runs on its own task and the returned handle reports how it ended.
    ///
    /// # Errors
    ///
    /// Returns [`SendRejected`] if the text is empty or too large, or if an
    /// exchange is already in flight. Nothing is written in that case.
    pub fn send_message(self: &Arc<Self>, text: &str) -> Result<ExchangeHandle, SendRejected> {
        let content = validate_content(text)?.to_owned();
        let Some(guard) = InFlight::try_acquire(&self.processing) else {
            tracing::debug!("send rejected: exchange in flight");
            return Err(SendRejected::ExchangeInFlight);
        };

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _guard = guard;
            let result = this.run_exchange(content).await;
            match &result {
                Ok(report) => tracing::info!(
                    user_id = %report.user_id,
                    assistant_id = %report.assistant_id,
                    "exchange completed"
                ),
                Err(e) => tracing::warn!(error = %e, "exchange aborted"),
            }
            result
        });

        Ok(ExchangeHandle { task })
    }

    /// Whether an exchange is in flight.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        *self.processing.borrow()
    }

    /// A receiver notified whenever the in-flight flag flips.
    #[must_use]
    pub fn subscribe_processing(&self) -> watch::Receiver<bool> {
        self.processing.subscribe()
    }

    async fn run_exchange(&self, content: String) -> Result<ExchangeReport, ExchangeError> {
        let user = self
            .create(Role::User, content, MessageStatus::Sending, ExchangeStep::CreateUser)
            .await?;
        tracing::debug!(message_id = %user.id, "user message created");

        tokio::time::sleep(self.delays.ack_delay()).await;
        self.advance(&user, MessageStatus::Sent, ExchangeStep::MarkSent)
            .await?;

        let reply = responses::pick_response().to_owned();
        let assistant = self
            .create(
                Role::Assistant,
                reply,
                MessageStatus::Processing,
                ExchangeStep::CreateAssistant,
            )
            .await?;
        tracing::debug!(message_id = %assistant.id, "assistant message created");

        tokio::time::sleep(self.delays.think_time()).await;
        self.advance(&assistant, MessageStatus::Completed, ExchangeStep::MarkCompleted)
            .await?;

        Ok(ExchangeReport {
            user_id: user.id,
            assistant_id: assistant.id,
        })
    }

    /// Create a message and reconcile the returned record.
    async fn create(
        &self,
        role: Role,
        content: String,
        status: MessageStatus,
        step: ExchangeStep,
    ) -> Result<Message, ExchangeError> {
        let created = self
            .gateway
            .create_message(role, content, status)
            .await
            .map_err(|source| ExchangeError::Write { step, source })?;
        self.merge
            .apply(created.clone(), Origin::DirectWrite)
            .await?;
        Ok(created)
    }

    /// Write a status follow-up and reconcile it, marking the message
    /// `error` if the write fails.
    async fn advance(
        &self,
        message: &Message,
        status: MessageStatus,
        step: ExchangeStep,
    ) -> Result<(), ExchangeError> {
        match self.gateway.update_message_status(&message.id, status).await {
            Ok(()) => {
                self.merge
                    .apply(message.with_status(status), Origin::DirectWrite)
                    .await?;
                Ok(())
            }
            Err(source) => {
                self.mark_error(message).await;
                Err(ExchangeError::Write { step, source })
            }
        }
    }

    /// Best-effort `error` write; the local view is updated regardless.
    async fn mark_error(&self, message: &Message) {
        if let Err(e) = self
            .gateway
            .update_message_status(&message.id, MessageStatus::Error)
            .await
        {
            tracing::warn!(message_id = %message.id, error = %e, "failed to persist error status");
        }
        if self
            .merge
            .apply(message.with_status(MessageStatus::Error), Origin::DirectWrite)
            .await
            .is_err()
        {
            tracing::debug!(message_id = %message.id, "merge loop gone, error status not reconciled");
        }
    }
}
