//! SSE (Server-Sent Events) decoding for streamed runs.
//!
//! A streamed run sends named events:
//!
//! ```text
//! event: thread.run.created
//! data: {"id":"run_1","object":"thread.run","status":"queued",...}
//!
//! event: thread.message.delta
//! data: {"id":"msg_1","delta":{"content":[{"index":0,"type":"text","text":{"value":"[{\"id\""}}]}}
//!
//! event: done
//! data: [DONE]
//! ```
//!
//! [`SseDecoder`] turns raw body bytes into [`SseEvent`]s, and
//! [`StreamEvent::from_sse`] interprets the ones the producers care about.

use serde::Deserialize;

use crate::error::{ProviderError, Result};
use crate::types::{Run, ThreadMessage};

/// The sentinel payload that ends a stream.
const DONE_SENTINEL: &str = "[DONE]";

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the last `event:` line, if any.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Incremental decoder. Feed it body chunks in arrival order.
///
/// Bytes are buffered until a full line is present, so a chunk boundary
/// inside a multi-byte character does not corrupt the text.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(ev) = self.line(line.trim_end_matches(['\n', '\r'])) {
                events.push(ev);
            }
        }
        events
    }

    /// Flush whatever is left once the body ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let rest = String::from_utf8_lossy(&rest).into_owned();
            if let Some(ev) = self.line(rest.trim_end_matches('\r')) {
                return Some(ev);
            }
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            // id:, retry: and unknown fields are ignored.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let ev = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(ev)
    }
}

/// A streamed run event, reduced to what the producers act on.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The run exists; its id is needed to cancel it.
    RunCreated(Run),
    /// A fragment of assistant text.
    TextDelta(String),
    /// The full text of a finished assistant message.
    MessageCompleted(String),
    RunCompleted(Run),
    /// `failed`, `cancelled`, `expired` or `incomplete`.
    RunEnded(Run),
    /// A stream-level `error` event.
    Error(String),
    Done,
    /// Anything else (step events, status transitions).
    Ignored,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: DeltaBody,
}

#[derive(Deserialize)]
struct DeltaBody {
    #[serde(default)]
    content: Vec<DeltaContent>,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(default)]
    text: Option<DeltaText>,
}

#[derive(Deserialize)]
struct DeltaText {
    #[serde(default)]
    value: Option<String>,
}

impl StreamEvent {
    /// Interpret a decoded SSE event.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidResponse`] when a known event carries
    /// a payload of the wrong shape.
    pub fn from_sse(ev: &SseEvent) -> Result<StreamEvent> {
        if ev.data.trim() == DONE_SENTINEL {
            return Ok(StreamEvent::Done);
        }
        let name = ev.event.as_deref().unwrap_or_default();
        let event = match name {
            "done" => StreamEvent::Done,
            "error" => StreamEvent::Error(ev.data.clone()),
            "thread.run.created" => StreamEvent::RunCreated(parse(name, &ev.data)?),
            "thread.run.completed" => StreamEvent::RunCompleted(parse(name, &ev.data)?),
            "thread.run.failed"
            | "thread.run.cancelled"
            | "thread.run.expired"
            | "thread.run.incomplete" => StreamEvent::RunEnded(parse(name, &ev.data)?),
            "thread.message.delta" => {
                let delta: MessageDelta = parse(name, &ev.data)?;
                let text: String = delta
                    .delta
                    .content
                    .into_iter()
                    .filter_map(|c| c.text.and_then(|t| t.value))
                    .collect();
                if text.is_empty() {
                    StreamEvent::Ignored
                } else {
                    StreamEvent::TextDelta(text)
                }
            }
            "thread.message.completed" => {
                let msg: ThreadMessage = parse(name, &ev.data)?;
                StreamEvent::MessageCompleted(msg.text())
            }
            _ => StreamEvent::Ignored,
        };
        Ok(event)
    }
}

fn parse<T: for<'de> Deserialize<'de>>(event: &str, data: &str) -> Result<T> {
    serde_json::from_str(data)
        .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse {event} event: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunStatus;

    // ── Decoder ─────────────────────────────────────────────────────

    #[test]
    fn decodes_named_event() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"event: thread.run.created\ndata: {\"a\":1}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("thread.run.created".into()),
                data: "{\"a\":1}".into()
            }]
        );
    }

    #[test]
    fn event_split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"event: do").is_empty());
        assert!(dec.push(b"ne\ndata: [DO").is_empty());
        let events = dec.push(b"NE]\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("done"));
        assert_eq!(events[0].data, "[DONE]");
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let mut dec = SseDecoder::new();
        let bytes = "data: h\u{e9}llo\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xc3).unwrap() + 1;
        assert!(dec.push(&bytes[..split]).is_empty());
        let events = dec.push(&bytes[split..]);
        assert_eq!(events[0].data, "h\u{e9}llo");
    }

    #[test]
    fn crlf_and_comments() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b": keep-alive\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, None);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn multiple_data_lines_join() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"event: done\ndata: [DONE]").is_empty());
        let ev = dec.finish().unwrap();
        assert_eq!(ev.data, "[DONE]");
        assert!(dec.finish().is_none());
    }

    // ── Event interpretation ────────────────────────────────────────

    fn sse(event: &str, data: &str) -> SseEvent {
        SseEvent {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    #[test]
    fn message_delta_text() {
        let ev = sse(
            "thread.message.delta",
            r#"{"id":"msg_1","object":"thread.message.delta","delta":{"content":[{"index":0,"type":"text","text":{"value":"[{\"id\""}}]}}"#,
        );
        match StreamEvent::from_sse(&ev).unwrap() {
            StreamEvent::TextDelta(t) => assert_eq!(t, "[{\"id\""),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn run_failed_is_run_ended() {
        let ev = sse(
            "thread.run.failed",
            r#"{"id":"run_1","status":"failed","last_error":{"code":"rate_limit_exceeded","message":"try again in 2s"}}"#,
        );
        match StreamEvent::from_sse(&ev).unwrap() {
            StreamEvent::RunEnded(run) => {
                assert_eq!(run.status, RunStatus::Failed);
                assert!(run.is_rate_limited());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn done_sentinel_without_event_name() {
        let ev = SseEvent {
            event: None,
            data: "[DONE]".into(),
        };
        assert!(matches!(StreamEvent::from_sse(&ev).unwrap(), StreamEvent::Done));
    }

    #[test]
    fn unknown_events_are_ignored() {
        let ev = sse("thread.run.step.created", "{}");
        assert!(matches!(
            StreamEvent::from_sse(&ev).unwrap(),
            StreamEvent::Ignored
        ));
    }

    #[test]
    fn malformed_known_event_is_error() {
        let ev = sse("thread.run.created", "not json");
        let err = StreamEvent::from_sse(&ev).unwrap_err();
        assert!(err.to_string().contains("thread.run.created"));
    }
}
