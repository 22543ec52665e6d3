//! Conversation message types for the Fulcrum chat engine.
//!
//! A [`Message`] is the only entity in the system. Its `id` and `created_at`
//! are assigned by the persistence layer; its `status` moves forward along
//! the lifecycle graph described on [`MessageStatus`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Unique identifier for a message, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person typing into the chat.
    User,
    /// The simulated reply generator.
    Assistant,
}

impl Role {
    /// Column value used by the persistence layer.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Lifecycle status of a message.
///
/// ```text
///  (create user msg)      -> Sending    -> Sent
///  (create assistant msg) -> Processing -> Completed
///  any state -> Error   (on write failure; terminal)
/// ```
///
/// The graph is encoded as a rank: creation states rank 0, their follow-up
/// states rank 1, and `Error` ranks 2. A status may only be replaced by one
/// of equal or higher rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// User message created, follow-up write not yet done.
    Sending,
    /// User message durably recorded.
    Sent,
    /// Assistant reply created, generation still running.
    Processing,
    /// Assistant reply finished.
    Completed,
    /// A write in the message's lifecycle failed.
    Error,
}

impl MessageStatus {
    /// Position of this status in the lifecycle graph.
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Sending | Self::Processing => 0,
            Self::Sent | Self::Completed => 1,
            Self::Error => 2,
        }
    }

    /// Whether a message in this status may be overwritten with `next`.
    ///
    /// Equal ranks are allowed so re-applying the same status is a no-op
    /// rather than a rejection.
    #[must_use]
    pub const fn can_advance_to(&self, next: Self) -> bool {
        next.rank() >= self.rank()
    }

    /// Whether no further lifecycle writes are expected.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Completed | Self::Error)
    }

    /// Column value used by the persistence layer.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Returned when a column value does not name a known role or status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value `{0}`")]
pub struct UnknownVariant(pub String);

/// A persisted conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned identifier.
    pub id: MessageId,
    /// Author of the message.
    pub role: Role,
    /// Text payload.
    pub content: String,
    /// Current lifecycle status.
    pub status: MessageStatus,
    /// Server-assigned creation time, the ordering key.
    pub created_at: Timestamp,
}

impl Message {
    /// Returns a copy of this message with a different status.
    #[must_use]
    pub fn with_status(&self, status: MessageStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Error returned when outgoing text fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Text is empty or whitespace only.
    #[error("message content is empty")]
    Empty,
    /// Text exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Trims outgoing text and checks it is non-empty and within
/// [`MAX_MESSAGE_SIZE`].
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for blank text, or
/// [`ValidationError::TooLarge`] if the trimmed text exceeds the limit.
pub fn validate_content(text: &str) -> Result<&str, ValidationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    let size = trimmed.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(trimmed)
}
