//! Change-feed event types.
//!
//! The persistence layer reports every create and update as a [`FeedEvent`]
//! carrying the full row. Rows arrive untyped (every column optional) and
//! are converted into a [`Message`] with [`Message::try_from`], which is
//! where malformed rows are caught.

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageId, MessageStatus, Role, Timestamp};

/// What kind of change a feed event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// A row was inserted.
    Create,
    /// An existing row was updated.
    Mutate,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => f.write_str("CREATE"),
            Self::Mutate => f.write_str("MUTATE"),
        }
    }
}

/// A full message row as delivered by the feed, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedRecord {
    /// Row id (UUID string).
    pub id: Option<String>,
    /// `user` or `assistant`.
    pub role: Option<String>,
    /// Message text.
    pub content: Option<String>,
    /// Lifecycle status column.
    pub status: Option<String>,
    /// Creation time in milliseconds since the UNIX epoch.
    pub created_at: Option<u64>,
}

impl From<&Message> for FeedRecord {
    fn from(msg: &Message) -> Self {
        Self {
            id: Some(msg.id.to_string()),
            role: Some(msg.role.as_str().to_string()),
            content: Some(msg.content.clone()),
            status: Some(msg.status.as_str().to_string()),
            created_at: Some(msg.created_at.as_millis()),
        }
    }
}

/// One notification from the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEvent {
    /// Whether the row was created or mutated.
    pub kind: ChangeKind,
    /// The full row after the change.
    pub record: FeedRecord,
}

impl FeedEvent {
    /// Builds an event for a typed message.
    #[must_use]
    pub fn new(kind: ChangeKind, msg: &Message) -> Self {
        Self {
            kind,
            record: FeedRecord::from(msg),
        }
    }
}

/// A feed row that cannot be turned into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// A required column is absent.
    #[error("record is missing `{0}`")]
    MissingField(&'static str),
    /// A column holds a value that does not parse.
    #[error("record field `{field}` has invalid value `{value}`")]
    InvalidField {
        /// Column name.
        field: &'static str,
        /// Offending value.
        value: String,
    },
}

impl TryFrom<FeedRecord> for Message {
    type Error = MergeError;

    fn try_from(record: FeedRecord) -> Result<Self, Self::Error> {
        let raw_id = record.id.ok_or(MergeError::MissingField("id"))?;
        let id: MessageId = raw_id.parse().map_err(|_| MergeError::InvalidField {
            field: "id",
            value: raw_id.clone(),
        })?;

        let raw_role = record.role.ok_or(MergeError::MissingField("role"))?;
        let role: Role = raw_role.parse().map_err(|_| MergeError::InvalidField {
            field: "role",
            value: raw_role.clone(),
        })?;

        let raw_status = record.status.ok_or(MergeError::MissingField("status"))?;
        let status: MessageStatus = raw_status.parse().map_err(|_| MergeError::InvalidField {
            field: "status",
            value: raw_status.clone(),
        })?;

        let content = record.content.ok_or(MergeError::MissingField("content"))?;
        let created_at = record
            .created_at
            .map(Timestamp::from_millis)
            .ok_or(MergeError::MissingField("created_at"))?;

        Ok(Self {
            id,
            role,
            content,
            status,
            created_at,
        })
    }
}
