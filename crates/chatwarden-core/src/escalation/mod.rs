//! Per-user escalation of moderation actions.
//!
//! - [`policy`] decides the next action from a user's recent history
//! - [`tracker`] owns every user's history inside one task and answers
//!   violation events with [`Decision::Action`](chatwarden_types::event::Decision)
//! - [`history`] persists that history as a JSON snapshot

pub mod history;
pub mod policy;
pub mod tracker;

use chatwarden_types::Category;
use chatwarden_types::event::{Action, FlaggedMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use policy::EscalationPolicy;
pub use tracker::{EscalationTracker, TrackerHandle};

/// How hard a violation should be treated, on top of the category policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Severity {
    #[default]
    Normal,
    /// Start one rung higher, as for a severe category.
    Severe,
}

/// A flagged message reported to the tracker.
#[derive(Debug, Clone)]
pub struct ViolationEvent {
    pub user: String,
    pub category: Category,
    pub severity: Severity,
    pub message_id: String,
    /// Classifier rationale, carried into the action's note.
    pub rationale: String,
    pub observed_at: DateTime<Utc>,
}

impl ViolationEvent {
    pub fn from_flagged(flagged: &FlaggedMessage, observed_at: DateTime<Utc>) -> Self {
        Self {
            user: flagged.user.clone(),
            category: flagged.category,
            severity: Severity::Normal,
            message_id: flagged.message_id.clone(),
            rationale: flagged.note.clone(),
            observed_at,
        }
    }
}

/// One violation in a user's history. Appended, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub user: String,
    pub category: Category,
    pub timestamp: DateTime<Utc>,
    /// What was actually issued; `None` when policy chose leniency.
    pub action_taken: Option<Action>,
}
