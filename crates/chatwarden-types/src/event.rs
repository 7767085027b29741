//! Events flowing through the moderation pipeline.
//!
//! [`ChatMessage`] is what the transport delivers, [`Batch`] is what the
//! collector hands to the coordinator, [`Decision`] is what comes back from
//! the classifier or the escalation tracker, and [`OutboundAction`] is what
//! the coordinator asks the transport to carry out.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::category::Category;

/// A chat message received from the transport. Never mutated after receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Transport-assigned message id.
    pub id: String,

    /// Login name of the sender (lower-case on Twitch).
    pub user: String,

    /// Message text.
    pub text: String,

    /// When the transport says the message was sent.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Badge names without versions (e.g. `moderator`, `subscriber`).
    #[serde(default)]
    pub badges: BTreeSet<String>,

    /// Raw transport tags, already unescaped.
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl ChatMessage {
    /// Transport user id, when the transport supplied one.
    pub fn user_id(&self) -> Option<&str> {
        self.tags.get("user-id").map(String::as_str)
    }

    /// Display name, falling back to the login.
    pub fn display_name(&self) -> &str {
        self.tags
            .get("display-name")
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.user)
    }

    /// Whether the sender is the broadcaster or a moderator.
    pub fn is_privileged(&self) -> bool {
        self.badges.contains("broadcaster") || self.badges.contains("moderator")
    }
}

/// Channel metadata sent alongside each batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A group of messages submitted together for classification.
///
/// A batch is built by the collector and then moved into the coordinator;
/// it is consumed by value when dispatched, so it can be sent at most once.
#[derive(Debug, Clone)]
pub struct Batch {
    seq: u64,
    messages: Vec<ChatMessage>,
    opened_at: Instant,
    estimated_size: usize,
}

impl Batch {
    pub fn new(
        seq: u64,
        messages: Vec<ChatMessage>,
        opened_at: Instant,
        estimated_size: usize,
    ) -> Self {
        Self {
            seq,
            messages,
            opened_at,
            estimated_size,
        }
    }

    /// Monotonic sequence number assigned by the collector.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Upper bound of the serialized payload size in bytes.
    pub fn estimated_size(&self) -> usize {
        self.estimated_size
    }

    /// Look up a message in this batch by id.
    pub fn find(&self, message_id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn message_ids(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().map(|m| m.id.as_str())
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }
}

/// A moderation action chosen for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Action {
    Warn,
    Timeout {
        #[serde(rename = "length")]
        seconds: u64,
    },
    Ban,
}

impl Action {
    /// Relative severity used to compare actions: warn < timeout < ban.
    pub fn rank(&self) -> u8 {
        match self {
            Action::Warn => 0,
            Action::Timeout { .. } => 1,
            Action::Ban => 2,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Warn => f.write_str("warn"),
            Action::Timeout { seconds } => write!(f, "timeout {seconds}s"),
            Action::Ban => f.write_str("ban"),
        }
    }
}

/// A message the classifier flagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedMessage {
    pub message_id: String,
    pub user: String,
    pub category: Category,
    /// Classifier rationale.
    pub note: String,
}

/// A moderation action chosen for a user by the escalation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationDecision {
    pub user: String,
    #[serde(flatten)]
    pub action: Action,
    pub note: String,
}

/// Structured output of the pipeline: a flagged message or an applied action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    Flagged(FlaggedMessage),
    Action(ModerationDecision),
}

impl Decision {
    pub fn user(&self) -> &str {
        match self {
            Decision::Flagged(f) => &f.user,
            Decision::Action(a) => &a.user,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Decision::Flagged(f) => Some(&f.message_id),
            Decision::Action(_) => None,
        }
    }

    pub fn note(&self) -> &str {
        match self {
            Decision::Flagged(f) => &f.note,
            Decision::Action(a) => &a.note,
        }
    }
}

/// What the transport should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Delete { message_id: String },
    Warn,
    Timeout { seconds: u64 },
    Ban,
}

/// A command for the transport, optionally paired with a visible chat note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAction {
    pub user: String,
    pub kind: ActionKind,
    /// Reason passed to the moderation API.
    pub reason: String,
    /// When present, posted to chat as `@user <note>` after the command.
    pub note: Option<String>,
}

impl OutboundAction {
    /// Delete a flagged message. Deletions never post a note.
    pub fn delete(flagged: &FlaggedMessage) -> Self {
        Self {
            user: flagged.user.clone(),
            kind: ActionKind::Delete {
                message_id: flagged.message_id.clone(),
            },
            reason: format!("{}: {}", flagged.category, flagged.note),
            note: None,
        }
    }

    /// Carry out an escalation decision and post its note.
    pub fn from_decision(decision: &ModerationDecision) -> Self {
        let kind = match decision.action {
            Action::Warn => ActionKind::Warn,
            Action::Timeout { seconds } => ActionKind::Timeout { seconds },
            Action::Ban => ActionKind::Ban,
        };
        let note = (!decision.note.trim().is_empty()).then(|| decision.note.clone());
        Self {
            user: decision.user.clone(),
            kind,
            reason: decision.note.clone(),
            note,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self.kind {
            ActionKind::Delete { .. } => "delete",
            ActionKind::Warn => "warn",
            ActionKind::Timeout { .. } => "timeout",
            ActionKind::Ban => "ban",
        }
    }
}
