//! Turning assistant text into typed decisions.
//!
//! The assistant answers with a JSON array of flagged items:
//!
//! ```json
//! [{"id":"m2","user":"alice","category":"HARASSMENT","rationale":"insults another chatter"}]
//! ```
//!
//! Models do not always comply exactly, so the parser also accepts a
//! Markdown code fence around the JSON, leading prose, an object wrapping
//! the array under `flagged`/`violations`, and `reason`/`note` in place of
//! `rationale`. Each item is validated against the batch on its own; a bad
//! item is dropped without affecting the others.

use std::collections::HashSet;

use chatwarden_types::event::{Batch, Decision, FlaggedMessage};
use chatwarden_types::{Category, ClassifyError};
use serde_json::Value;
use tracing::{debug, warn};

/// Result of parsing a complete response.
#[derive(Debug, Default)]
pub struct ParsedResponse {
    /// Valid items in response order, at most one per message id.
    pub decisions: Vec<Decision>,
    /// Items that failed validation.
    pub dropped: usize,
}

/// Parse a complete assistant response.
///
/// # Errors
///
/// [`ClassifyError::BadResponse`] when the text holds no JSON array or
/// object at all. Individual bad items are counted in
/// [`ParsedResponse::dropped`] instead.
pub fn parse_response(text: &str, batch: &Batch) -> Result<ParsedResponse, ClassifyError> {
    let body = strip_code_fence(text);
    if body.is_empty() {
        return Err(ClassifyError::BadResponse("empty response".into()));
    }

    let value = serde_json::from_str::<Value>(body)
        .ok()
        .or_else(|| extract_json(body))
        .ok_or_else(|| ClassifyError::BadResponse(format!("not JSON: {}", preview(body))))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            match ["flagged", "violations", "messages", "results"]
                .iter()
                .find_map(|key| match map.remove(*key) {
                    Some(Value::Array(items)) => Some(items),
                    _ => None,
                }) {
                Some(items) => items,
                None if map.contains_key("id") => vec![Value::Object(map)],
                None => {
                    return Err(ClassifyError::BadResponse(
                        "object without a flagged-items array".into(),
                    ));
                }
            }
        }
        other => {
            return Err(ClassifyError::BadResponse(format!(
                "expected a JSON array, got {}",
                preview(&other.to_string())
            )));
        }
    };

    let mut parsed = ParsedResponse::default();
    let mut seen = HashSet::new();
    for item in &items {
        match validate_item(item, batch) {
            Ok(flagged) => {
                if seen.insert(flagged.message_id.clone()) {
                    parsed.decisions.push(Decision::Flagged(flagged));
                } else {
                    debug!(message_id = %flagged.message_id, "duplicate flagged item ignored");
                }
            }
            Err(reason) => {
                warn!(batch = batch.seq(), %reason, "dropping flagged item");
                parsed.dropped += 1;
            }
        }
    }
    Ok(parsed)
}

/// Validate one flagged item against the batch it answers.
///
/// The user is taken from the batch message, not from the item: the
/// transport is authoritative about who sent what.
pub fn validate_item(item: &Value, batch: &Batch) -> Result<FlaggedMessage, String> {
    let obj = item
        .as_object()
        .ok_or_else(|| format!("item is not an object: {}", preview(&item.to_string())))?;

    let message_id = match obj.get("id").or_else(|| obj.get("message_id")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err("item has no message id".into()),
    };
    let message = batch
        .find(&message_id)
        .ok_or_else(|| format!("item names unknown message id {message_id:?}"))?;

    let category = obj
        .get("category")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("item {message_id:?} has no category"))?
        .parse::<Category>()?;

    let note = ["rationale", "reason", "note", "notes"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_owned();

    if let Some(claimed) = obj.get("user").and_then(Value::as_str)
        && !claimed.eq_ignore_ascii_case(&message.user)
    {
        debug!(
            message_id = %message_id,
            claimed,
            actual = %message.user,
            "classifier named a different user; using the sender"
        );
    }

    Ok(FlaggedMessage {
        message_id,
        user: message.user.clone(),
        category,
        note,
    })
}

/// Remove a surrounding Markdown code fence, if present.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") on the opening line.
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().trim_end_matches("```").trim()
}

/// Find the outermost JSON array (or object) inside surrounding prose.
fn extract_json(text: &str) -> Option<Value> {
    for (open, close) in [('[', ']'), ('{', '}')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close))
            && start < end
            && let Ok(v) = serde_json::from_str(&text[start..=end])
        {
            return Some(v);
        }
    }
    None
}

fn preview(s: &str) -> String {
    const MAX: usize = 80;
    if s.len() <= MAX {
        return s.to_owned();
    }
    let mut end = MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Extracts complete array elements from assistant text as it streams in.
///
/// Tracks JSON nesting (strings and escapes included) across fragments and
/// yields the source text of every object whose parent is an array, as soon
/// as its closing brace arrives.
#[derive(Debug, Default)]
pub struct IncrementalScanner {
    buf: String,
    pos: usize,
    /// Open containers: the bracket and its byte offset.
    stack: Vec<(u8, usize)>,
    in_string: bool,
    escaped: bool,
}

impl IncrementalScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return the newly completed item objects.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buf.push_str(fragment);
        let mut items = Vec::new();
        let bytes = self.buf.as_bytes();
        let mut i = self.pos;
        while i < bytes.len() {
            let b = bytes[i];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' if !self.stack.is_empty() => self.in_string = true,
                    b'[' | b'{' => self.stack.push((b, i)),
                    b']' => {
                        self.stack.pop();
                    }
                    b'}' => {
                        if let Some((b'{', start)) = self.stack.pop()
                            && matches!(self.stack.last(), Some((b'[', _)))
                        {
                            items.push(self.buf[start..=i].to_owned());
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }
        self.pos = i;
        items
    }

    /// Everything pushed so far.
    pub fn text(&self) -> &str {
        &self.buf
    }
}
