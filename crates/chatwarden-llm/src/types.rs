//! Wire types for the Assistants-style engine API.

use serde::{Deserialize, Serialize};

use crate::retry::parse_try_again;

#[derive(Debug, Clone, Deserialize)]
pub struct Thread {
    pub id: String,
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Whether the run will not change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled
                | RunStatus::Failed
                | RunStatus::Completed
                | RunStatus::Incomplete
                | RunStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Token accounting reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub last_error: Option<RunError>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl Run {
    pub fn is_rate_limited(&self) -> bool {
        self.status == RunStatus::Failed
            && self
                .last_error
                .as_ref()
                .is_some_and(|e| e.code == "rate_limit_exceeded")
    }

    /// Wait suggested by the failure message, if it names one.
    pub fn retry_hint(&self) -> Option<std::time::Duration> {
        self.last_error
            .as_ref()
            .and_then(|e| parse_try_again(&e.message))
    }

    pub fn error_message(&self) -> String {
        match &self.last_error {
            Some(e) if !e.message.is_empty() => format!("{}: {}", e.code, e.message),
            Some(e) => e.code.clone(),
            None => "no error reported".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunList {
    #[serde(default)]
    pub data: Vec<Run>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: TextValue },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextValue {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

impl ThreadMessage {
    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.value.as_str()),
                ContentPart::Other => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageList {
    #[serde(default)]
    pub data: Vec<ThreadMessage>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateRun<'a> {
    pub assistant_id: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}
