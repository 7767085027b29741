//! Request payload sent to the engine, and the size/token estimates built on it.
//!
//! Each chat message is reduced to `{id, user, text, timestamp, badges}`
//! and the batch is wrapped with the channel context:
//!
//! ```json
//! {"context":{"game":"Chess"},"messages":[{"id":"m1","user":"alice","text":"hi","timestamp":"..."}]}
//! ```

use chatwarden_types::event::{Batch, ChatMessage, StreamContext};
use serde::Serialize;

/// Bytes reserved for the envelope and the context when sizing a batch.
pub const ENVELOPE_RESERVE: usize = 1024;

/// A chat message as the engine sees it.
#[derive(Debug, Serialize)]
pub struct WireMessage<'a> {
    pub id: &'a str,
    pub user: &'a str,
    pub text: &'a str,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub badges: Vec<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub first_message: bool,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(msg: &'a ChatMessage) -> Self {
        Self {
            id: &msg.id,
            user: &msg.user,
            text: &msg.text,
            timestamp: msg.timestamp.to_rfc3339(),
            badges: msg.badges.iter().map(String::as_str).collect(),
            first_message: msg.tags.get("first-msg").is_some_and(|v| v == "1"),
        }
    }
}

#[derive(Debug, Serialize)]
struct Payload<'a> {
    context: &'a StreamContext,
    messages: Vec<WireMessage<'a>>,
}

/// Serialized size of one message inside the `messages` array, separator included.
pub fn message_size(msg: &ChatMessage) -> usize {
    let wire = WireMessage::from(msg);
    match serde_json::to_string(&wire) {
        Ok(json) => json.len() + 1,
        // Worst case: every byte escaped as \uXXXX, plus field names.
        Err(_) => msg.text.len() * 6 + msg.id.len() + msg.user.len() + 128,
    }
}

/// Serialize a batch with its context.
pub fn build_payload(batch: &Batch, context: &StreamContext) -> serde_json::Result<String> {
    serde_json::to_string(&Payload {
        context,
        messages: batch.messages().iter().map(WireMessage::from).collect(),
    })
}

/// Token estimate for a payload: a quarter of its byte length, rounded up,
/// plus the fixed instruction overhead.
pub fn estimate_tokens(payload: &str, prompt_overhead_tokens: u32) -> u32 {
    let body = payload.len().div_ceil(4);
    u32::try_from(body)
        .unwrap_or(u32::MAX)
        .saturating_add(prompt_overhead_tokens)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::time::Instant;

    use chrono::{TimeZone, Utc};

    use super::*;

    fn msg(id: &str, text: &str) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            user: "alice".into(),
            text: text.into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            badges: BTreeSet::from(["subscriber".to_string()]),
            tags: HashMap::from([("first-msg".to_string(), "1".to_string())]),
        }
    }

    #[test]
    fn payload_shape() {
        let batch = Batch::new(1, vec![msg("m1", "hello")], Instant::now(), 0);
        let ctx = StreamContext {
            game: Some("Chess".into()),
            title: None,
        };
        let json: serde_json::Value =
            serde_json::from_str(&build_payload(&batch, &ctx).unwrap()).unwrap();
        assert_eq!(json["context"]["game"], "Chess");
        assert!(json["context"].get("title").is_none());
        let m = &json["messages"][0];
        assert_eq!(m["id"], "m1");
        assert_eq!(m["user"], "alice");
        assert_eq!(m["text"], "hello");
        assert_eq!(m["badges"][0], "subscriber");
        assert_eq!(m["first_message"], true);
        assert!(m["timestamp"].as_str().unwrap().starts_with("2024-05-01T12:00:00"));
    }

    #[test]
    fn message_sizes_bound_the_payload() {
        let messages = vec![msg("m1", "hello"), msg("m2", "quote \" and \u{1F600}")];
        let sum: usize = messages.iter().map(message_size).sum();
        let batch = Batch::new(1, messages, Instant::now(), sum);
        let payload = build_payload(&batch, &StreamContext::default()).unwrap();
        assert!(payload.len() <= sum + ENVELOPE_RESERVE);
    }

    #[test]
    fn token_estimate_rounds_up_and_adds_overhead() {
        assert_eq!(estimate_tokens("", 0), 0);
        assert_eq!(estimate_tokens("abcde", 0), 2);
        assert_eq!(estimate_tokens("abcd", 100), 101);
    }
}
