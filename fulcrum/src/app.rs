//! Application state and line rendering for the terminal front end.

use std::fmt::Write as _;

use chrono::{Local, TimeZone};

use fulcrum_proto::message::{Message, MessageStatus, Role, Timestamp};

use crate::sync::StoreEvent;
use crate::sync::feed::Connectivity;

/// A parsed line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Plain text to send.
    Text(String),
    /// `/quit`
    Quit,
    /// `/history`: reprint the conversation.
    History,
    /// `/dump`: print the conversation as JSON.
    Dump,
    /// `/drop-feed`: sever the change-feed subscription.
    DropFeed,
    /// `/help`
    Help,
    /// A slash command that is not recognized.
    Unknown(String),
}

impl Input {
    /// Parse one input line.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if !trimmed.starts_with('/') {
            return Self::Text(line.to_string());
        }
        match trimmed {
            "/quit" | "/q" => Self::Quit,
            "/history" => Self::History,
            "/dump" => Self::Dump,
            "/drop-feed" => Self::DropFeed,
            "/help" => Self::Help,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Help text listing the slash commands.
pub const HELP: &str = "commands: /history  /dump  /drop-feed  /quit";

/// Shown once a connected store turns out to hold no conversation.
pub const WELCOME: [&str; 3] = [
    "Fulcrum Insights Chat",
    "Ask me anything about your data and I'll provide insights and analysis to help you make informed decisions.",
    "Your chats aren't used to improve our models. Fulcrum Insights can make mistakes, so double-check your results.",
];

/// Display symbol for a message status.
#[must_use]
pub const fn status_symbol(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Sending | MessageStatus::Processing => "\u{22ef}",
        MessageStatus::Sent => "\u{2713}",
        MessageStatus::Completed => "\u{2713}\u{2713}",
        MessageStatus::Error => "\u{2717}",
    }
}

/// Display label for a role.
#[must_use]
pub const fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
    }
}

/// Front-end state: what the prompt shows and how lines are rendered.
#[derive(Debug)]
pub struct App {
    timestamp_format: String,
    connectivity: Connectivity,
    processing: bool,
    welcomed: bool,
    /// Set when the user asked to quit.
    pub should_quit: bool,
}

impl App {
    /// Create the front-end state.
    #[must_use]
    pub fn new(timestamp_format: impl Into<String>) -> Self {
        Self {
            timestamp_format: timestamp_format.into(),
            connectivity: Connectivity::Connecting,
            processing: false,
            welcomed: false,
            should_quit: false,
        }
    }

    /// Record a connectivity change; returns the line to print, if any.
    pub fn set_connectivity(&mut self, connectivity: Connectivity) -> Option<String> {
        if self.connectivity == connectivity {
            return None;
        }
        self.connectivity = connectivity;
        Some(match connectivity {
            Connectivity::Connecting => "* connecting to message store".to_string(),
            Connectivity::Connected => "* connected".to_string(),
            Connectivity::Degraded => "* connection degraded, retrying in the background".to_string(),
        })
    }

    /// Welcome lines to print on the first connect, if the store is empty.
    pub fn welcome(&mut self, snapshot: &[Message]) -> Option<[&'static str; 3]> {
        if self.welcomed || self.connectivity != Connectivity::Connected {
            return None;
        }
        self.welcomed = true;
        snapshot.is_empty().then_some(WELCOME)
    }

    /// Record whether an exchange is in flight.
    pub const fn set_processing(&mut self, processing: bool) {
        self.processing = processing;
    }

    /// Whether input should be sent right now.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.connectivity != Connectivity::Connecting && !self.processing
    }

    /// Prompt hint for the current state.
    #[must_use]
    pub fn placeholder(&self) -> &'static str {
        if self.connectivity == Connectivity::Connecting {
            "Connecting..."
        } else if self.processing {
            "Processing your message..."
        } else {
            "How can I help today?"
        }
    }

    /// Render a message as one line: `[time] role: content symbol`.
    #[must_use]
    pub fn render_message(&self, message: &Message) -> String {
        format!(
            "[{}] {}: {} {}",
            self.format_timestamp(message.created_at),
            role_label(message.role),
            message.content,
            status_symbol(message.status),
        )
    }

    /// Render a store event, looking up the message in `snapshot` for status
    /// changes. Returns `None` if there is nothing to show.
    #[must_use]
    pub fn render_event(&self, event: &StoreEvent, snapshot: &[Message]) -> Option<String> {
        match event {
            StoreEvent::Inserted(message) => Some(self.render_message(message)),
            StoreEvent::StatusChanged { message_id, to, .. } => {
                let message = snapshot.iter().find(|m| m.id == *message_id)?;
                Some(format!(
                    "  {} {} {}",
                    role_label(message.role),
                    to,
                    status_symbol(*to)
                ))
            }
        }
    }

    /// Falls back to `--:--` for out-of-range times and unusable formats.
    fn format_timestamp(&self, ts: Timestamp) -> String {
        let Some(time) = i64::try_from(ts.as_millis())
            .ok()
            .and_then(|millis| Local.timestamp_millis_opt(millis).single())
        else {
            return "--:--".to_string();
        };
        let mut out = String::new();
        if write!(out, "{}", time.format(&self.timestamp_format)).is_err() {
            return "--:--".to_string();
        }
        out
    }
}
