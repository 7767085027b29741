//! HTTP client for the Assistants-style engine.
//!
//! [`AssistantsEngine`] owns one conversation thread. Every batch is posted
//! to that thread as a user message, then a run of the configured assistant
//! produces the reply. The thread is either fixed in configuration, looked
//! up in a per-channel thread map file, or created on first use.

use std::collections::BTreeMap;
use std::path::Path;

use chatwarden_types::config::EngineConfig;
use chatwarden_types::secret::SecretString;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{ProviderError, Result};
use crate::types::{CreateMessage, CreateRun, MessageList, Run, RunList, Thread};

const BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");

/// Throttling wait when neither headers nor body name one.
const DEFAULT_RETRY_AFTER_MS: u64 = 5000;

pub struct AssistantsEngine {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    assistant_id: String,
    thread_id: String,
}

impl AssistantsEngine {
    /// Create an engine bound to `config.thread_id` (empty when unset; see
    /// [`resolve_thread`](Self::resolve_thread)).
    pub fn new(config: &EngineConfig, api_key: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key,
            assistant_id: config.assistant_id.clone(),
            thread_id: config.thread_id.clone().unwrap_or_default(),
        }
    }

    /// Use an explicit thread.
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn assistant_id(&self) -> &str {
        &self.assistant_id
    }

    /// Make sure the engine has a thread for `channel`.
    ///
    /// A configured thread id wins. Otherwise the thread map at `map_path`
    /// is consulted, and a new thread is created (and recorded there) when
    /// the channel has none.
    pub async fn resolve_thread(mut self, channel: &str, map_path: Option<&Path>) -> Result<Self> {
        if !self.thread_id.is_empty() {
            return Ok(self);
        }

        let mut map = match map_path {
            Some(path) => load_thread_map(path)?,
            None => BTreeMap::new(),
        };
        if let Some(id) = map.get(channel) {
            info!(channel, thread = %id, "reusing engine thread");
            self.thread_id = id.clone();
            return Ok(self);
        }

        let thread = self.create_thread().await?;
        info!(channel, thread = %thread.id, "created engine thread");
        if let Some(path) = map_path {
            map.insert(channel.to_owned(), thread.id.clone());
            save_thread_map(path, &map)?;
        }
        self.thread_id = thread.id;
        Ok(self)
    }

    pub async fn create_thread(&self) -> Result<Thread> {
        let url = format!("{}/threads", self.base_url);
        self.send(self.http.post(url).json(&serde_json::json!({})))
            .await
    }

    /// Post a batch payload to the thread as a user message.
    pub async fn add_message(&self, content: &str) -> Result<()> {
        let url = self.thread_url("messages");
        debug!(thread = %self.thread_id, bytes = content.len(), "posting batch to thread");
        let _: serde_json::Value = self
            .send(self.http.post(url).json(&CreateMessage {
                role: "user",
                content,
            }))
            .await?;
        Ok(())
    }

    pub async fn create_run(&self) -> Result<Run> {
        let url = self.thread_url("runs");
        self.send(self.http.post(url).json(&CreateRun {
            assistant_id: &self.assistant_id,
            stream: false,
        }))
        .await
    }

    /// Start a streamed run. The returned response body is an SSE stream.
    pub async fn create_run_stream(&self) -> Result<reqwest::Response> {
        let url = self.thread_url("runs");
        let req = self
            .authorize(self.http.post(url))
            .header("Accept", "text/event-stream")
            .json(&CreateRun {
                assistant_id: &self.assistant_id,
                stream: true,
            });
        check(req.send().await?).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        let url = self.thread_url(&format!("runs/{run_id}"));
        self.send(self.http.get(url)).await
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<Run> {
        let url = self.thread_url(&format!("runs/{run_id}/cancel"));
        self.send(self.http.post(url)).await
    }

    /// Cancel without reporting failure; used when abandoning a run.
    pub async fn cancel_quietly(&self, run_id: &str) {
        match self.cancel_run(run_id).await {
            Ok(_) => debug!(run = run_id, "cancelled run"),
            Err(e) => warn!(run = run_id, error = %e, "failed to cancel run"),
        }
    }

    /// Runs on the thread that have not finished.
    pub async fn active_runs(&self) -> Result<Vec<Run>> {
        let url = self.thread_url("runs?limit=20&order=desc");
        let list: RunList = self.send(self.http.get(url)).await?;
        Ok(list
            .data
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect())
    }

    /// Cancel runs left over from a previous process, so the thread accepts
    /// new messages. Returns how many were cancelled.
    pub async fn cancel_stale_runs(&self) -> Result<usize> {
        let runs = self.active_runs().await?;
        for run in &runs {
            warn!(run = %run.id, status = ?run.status, "cancelling stale run");
            self.cancel_quietly(&run.id).await;
        }
        Ok(runs.len())
    }

    /// Text of the newest message on the thread, which is the assistant's
    /// reply once a run has completed.
    pub async fn latest_assistant_text(&self) -> Result<String> {
        let url = self.thread_url("messages?limit=1&order=desc");
        let list: MessageList = self.send(self.http.get(url)).await?;
        let msg = list
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("thread has no messages".into()))?;
        if msg.role != "assistant" {
            return Err(ProviderError::InvalidResponse(format!(
                "latest message is from {:?}, not the assistant",
                msg.role
            )));
        }
        Ok(msg.text())
    }

    fn thread_url(&self, tail: &str) -> String {
        format!("{}/threads/{}/{tail}", self.base_url, self.thread_id)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.api_key.expose()))
            .header(BETA_HEADER.0, BETA_HEADER.1)
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let response = check(self.authorize(req).send().await?).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response: {e}")))
    }
}

impl std::fmt::Debug for AssistantsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantsEngine")
            .field("base_url", &self.base_url)
            .field("assistant_id", &self.assistant_id)
            .field("thread_id", &self.thread_id)
            .field("api_key", &self.api_key)
            .finish()
    }
}

/// Map a non-success status onto [`ProviderError`].
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status.as_u16() == 429 {
        let header_ms = parse_retry_after_header(&response);
        let body = response.text().await.unwrap_or_default();

        // insufficient_quota also arrives as 429 but never clears by waiting.
        if is_quota_exhausted(&body) {
            let msg = extract_error_message(&body)
                .unwrap_or_else(|| "quota exhausted or billing limit reached".into());
            warn!("engine quota exhausted (not retryable)");
            return Err(ProviderError::RequestFailed(msg));
        }

        let retry_after_ms = header_ms
            .or_else(|| parse_retry_after_ms(&body))
            .or_else(|| {
                extract_error_message(&body)
                    .and_then(|m| crate::retry::parse_try_again(&m))
                    .map(|d| d.as_millis() as u64)
            })
            .unwrap_or(DEFAULT_RETRY_AFTER_MS);
        debug!(retry_after_ms, "engine returned 429");
        return Err(ProviderError::RateLimited { retry_after_ms });
    }

    let body = response.text().await.unwrap_or_default();
    match status.as_u16() {
        401 | 403 => Err(ProviderError::AuthFailed(
            extract_error_message(&body).unwrap_or(body),
        )),
        404 => Err(ProviderError::NotFound(
            extract_error_message(&body).unwrap_or(body),
        )),
        _ => Err(ProviderError::RequestFailed(format!(
            "HTTP {status}: {body}"
        ))),
    }
}

fn is_quota_exhausted(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("insufficient_quota")
        || lower.contains("quota exceeded")
        || lower.contains("billing")
}

/// `{"error": {"message": "..."}}`
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let err = value.get("error")?;
    err.get("message")
        .and_then(|m| m.as_str())
        .or_else(|| err.as_str())
        .map(String::from)
}

/// Numeric `Retry-After` (seconds); HTTP-date values are not handled.
fn parse_retry_after_header(response: &reqwest::Response) -> Option<u64> {
    let value = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())?;
    let secs: f64 = value.trim().parse().ok()?;
    Some((secs * 1000.0).max(0.0) as u64)
}

fn parse_retry_after_ms(body: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("retry_after_ms")
        .and_then(|v| v.as_u64())
        .or_else(|| {
            value
                .get("retry_after")
                .and_then(|v| v.as_f64())
                .map(|secs| (secs * 1000.0) as u64)
        })
}

fn load_thread_map(path: &Path) -> Result<BTreeMap<String, String>> {
    match std::fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(ProviderError::RequestFailed(format!(
            "cannot read thread map {}: {e}",
            path.display()
        ))),
    }
}

/// Write through a temp file and rename, so a crash never leaves a torn map.
fn save_thread_map(path: &Path, map: &BTreeMap<String, String>) -> Result<()> {
    let io_err = |e: std::io::Error| {
        ProviderError::RequestFailed(format!("cannot write thread map {}: {e}", path.display()))
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(map)?).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_detection() {
        assert!(is_quota_exhausted(
            r#"{"error":{"code":"insufficient_quota","message":"You exceeded your current quota"}}"#
        ));
        assert!(!is_quota_exhausted(
            r#"{"error":{"code":"rate_limit_exceeded","message":"Rate limit reached"}}"#
        ));
    }

    #[test]
    fn error_message_shapes() {
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"nope"}}"#).as_deref(),
            Some("nope")
        );
        assert_eq!(
            extract_error_message(r#"{"error":"flat"}"#).as_deref(),
            Some("flat")
        );
        assert_eq!(extract_error_message("<html>"), None);
    }

    #[test]
    fn retry_after_from_body() {
        assert_eq!(parse_retry_after_ms(r#"{"retry_after_ms":750}"#), Some(750));
        assert_eq!(parse_retry_after_ms(r#"{"retry_after":1.5}"#), Some(1500));
        assert_eq!(parse_retry_after_ms("{}"), None);
    }

    #[test]
    fn thread_map_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("threads.json");
        assert!(load_thread_map(&path).unwrap().is_empty());

        let map = BTreeMap::from([("somechannel".to_string(), "thread_abc".to_string())]);
        save_thread_map(&path, &map).unwrap();
        assert_eq!(load_thread_map(&path).unwrap(), map);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn debug_redacts_key() {
        let engine = AssistantsEngine::new(&EngineConfig::default(), SecretString::new("sk-live"));
        let dbg = format!("{engine:?}");
        assert!(!dbg.contains("sk-live"));
    }
}
