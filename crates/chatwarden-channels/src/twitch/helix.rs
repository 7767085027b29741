//! Twitch Helix REST client.
//!
//! [`HelixClient`] covers the endpoints the bot needs: user lookups, the
//! moderation commands, chat messages for notes and channel info for the
//! classification context. Every request carries the `Client-Id` header
//! and a bearer token from the [`TokenProvider`]; a 401 triggers one
//! refresh and one retry.

use std::collections::HashMap;
use std::sync::Arc;

use chatwarden_types::TransportError;
use chatwarden_types::event::StreamContext;
use parking_lot::{Mutex, RwLock};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::auth::TokenProvider;

/// Helix caps reasons and chat messages at 500 characters.
pub const MAX_TEXT_CHARS: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
    pub id: String,
    pub login: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    #[serde(default)]
    game_name: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    is_sent: bool,
    #[serde(default)]
    drop_reason: Option<DropReason>,
}

#[derive(Debug, Deserialize)]
struct DropReason {
    #[serde(default)]
    message: String,
}

/// Broadcaster and moderator ids, resolved once per client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub broadcaster_id: String,
    pub moderator_id: String,
}

pub struct HelixClient {
    http: Client,
    base_url: String,
    client_id: String,
    channel: String,
    nick: String,
    auth: Arc<dyn TokenProvider>,
    identity: RwLock<Option<Identity>>,
    user_ids: Mutex<HashMap<String, String>>,
}

impl HelixClient {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        channel: impl Into<String>,
        nick: impl Into<String>,
        auth: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client_id: client_id.into(),
            channel: channel.into().to_ascii_lowercase(),
            nick: nick.into().to_ascii_lowercase(),
            auth,
            identity: RwLock::new(None),
            user_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Cache a login to id mapping learned elsewhere (IRC `user-id` tags).
    pub fn remember_user(&self, login: &str, id: &str) {
        self.user_ids
            .lock()
            .insert(login.to_ascii_lowercase(), id.to_owned());
    }

    /// Look up users by login, caching every id returned.
    pub async fn get_users(&self, logins: &[&str]) -> Result<Vec<HelixUser>, TransportError> {
        let url = format!("{}/users", self.base_url);
        let query: Vec<(&str, &str)> = logins.iter().map(|l| ("login", *l)).collect();
        let resp = self.execute(|| self.http.get(&url).query(&query)).await?;
        let body: DataEnvelope<HelixUser> = decode(resp).await?;
        let mut cache = self.user_ids.lock();
        for user in &body.data {
            cache.insert(user.login.to_ascii_lowercase(), user.id.clone());
        }
        Ok(body.data)
    }

    pub async fn user_id(&self, login: &str) -> Result<String, TransportError> {
        let key = login.to_ascii_lowercase();
        if let Some(id) = self.user_ids.lock().get(&key) {
            return Ok(id.clone());
        }
        self.get_users(&[key.as_str()])
            .await?
            .into_iter()
            .find(|u| u.login.eq_ignore_ascii_case(&key))
            .map(|u| u.id)
            .ok_or_else(|| TransportError::NotFound(format!("twitch user {key:?}")))
    }

    /// The broadcaster and moderator ids, looked up on first use.
    pub async fn identity(&self) -> Result<Identity, TransportError> {
        if let Some(identity) = self.identity.read().clone() {
            return Ok(identity);
        }
        let users = self
            .get_users(&[self.channel.as_str(), self.nick.as_str()])
            .await?;
        let find = |login: &str| {
            users
                .iter()
                .find(|u| u.login.eq_ignore_ascii_case(login))
                .map(|u| u.id.clone())
                .ok_or_else(|| TransportError::NotFound(format!("twitch user {login:?}")))
        };
        let identity = Identity {
            broadcaster_id: find(&self.channel)?,
            moderator_id: find(&self.nick)?,
        };
        debug!(
            broadcaster_id = %identity.broadcaster_id,
            moderator_id = %identity.moderator_id,
            "resolved helix identity"
        );
        *self.identity.write() = Some(identity.clone());
        Ok(identity)
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<(), TransportError> {
        let id = self.identity().await?;
        let url = format!("{}/moderation/chat", self.base_url);
        self.execute(|| {
            self.http.delete(&url).query(&[
                ("broadcaster_id", id.broadcaster_id.as_str()),
                ("moderator_id", id.moderator_id.as_str()),
                ("message_id", message_id),
            ])
        })
        .await?;
        Ok(())
    }

    /// Time out `user_id` for `duration` seconds, or ban when `None`.
    pub async fn ban(
        &self,
        user_id: &str,
        duration: Option<u64>,
        reason: &str,
    ) -> Result<(), TransportError> {
        let id = self.identity().await?;
        let url = format!("{}/moderation/bans", self.base_url);
        let mut data = json!({
            "user_id": user_id,
            "reason": truncate_chars(reason, MAX_TEXT_CHARS),
        });
        if let Some(seconds) = duration {
            data["duration"] = json!(seconds);
        }
        let body = json!({ "data": data });
        self.execute(|| {
            self.http
                .post(&url)
                .query(&moderation_query(&id))
                .json(&body)
        })
        .await?;
        Ok(())
    }

    pub async fn warn(&self, user_id: &str, reason: &str) -> Result<(), TransportError> {
        let id = self.identity().await?;
        let url = format!("{}/moderation/warnings", self.base_url);
        let body = json!({
            "data": {
                "user_id": user_id,
                "reason": truncate_chars(reason, MAX_TEXT_CHARS),
            }
        });
        self.execute(|| {
            self.http
                .post(&url)
                .query(&moderation_query(&id))
                .json(&body)
        })
        .await?;
        Ok(())
    }

    /// Post `message` to the channel as the moderator account.
    pub async fn send_chat(&self, message: &str) -> Result<(), TransportError> {
        let id = self.identity().await?;
        let url = format!("{}/chat/messages", self.base_url);
        let body = json!({
            "broadcaster_id": id.broadcaster_id,
            "sender_id": id.moderator_id,
            "message": truncate_chars(message, MAX_TEXT_CHARS),
        });
        let resp = self.execute(|| self.http.post(&url).json(&body)).await?;
        let sent: DataEnvelope<SentMessage> = decode(resp).await?;
        match sent.data.first() {
            Some(m) if !m.is_sent => Err(TransportError::Rejected(format!(
                "chat message dropped: {}",
                m.drop_reason
                    .as_ref()
                    .map(|r| r.message.as_str())
                    .unwrap_or("no reason given")
            ))),
            _ => Ok(()),
        }
    }

    /// Current game and title of the channel.
    pub async fn channel_info(&self) -> Result<StreamContext, TransportError> {
        let id = self.identity().await?;
        let url = format!("{}/channels", self.base_url);
        let resp = self
            .execute(|| {
                self.http
                    .get(&url)
                    .query(&[("broadcaster_id", id.broadcaster_id.as_str())])
            })
            .await?;
        let body: DataEnvelope<ChannelInfo> = decode(resp).await?;
        let info = body.data.into_iter().next();
        Ok(StreamContext {
            game: info
                .as_ref()
                .map(|i| i.game_name.clone())
                .filter(|s| !s.is_empty()),
            title: info.map(|i| i.title).filter(|s| !s.is_empty()),
        })
    }

    /// Send a request with auth headers; on 401 refresh the token and try
    /// exactly once more.
    async fn execute<F>(&self, build: F) -> Result<Response, TransportError>
    where
        F: Fn() -> RequestBuilder,
    {
        let token = self.auth.access_token().await?;
        let resp = self.send(build(), token.expose()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return check(resp).await;
        }

        warn!("helix refused the access token, refreshing");
        let fresh = self.auth.refresh(&token).await?;
        let resp = self.send(build(), fresh.expose()).await?;
        check(resp).await
    }

    async fn send(&self, req: RequestBuilder, token: &str) -> Result<Response, TransportError> {
        req.header("Client-Id", &self.client_id)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))
    }
}

fn moderation_query(id: &Identity) -> [(&'static str, String); 2] {
    [
        ("broadcaster_id", id.broadcaster_id.clone()),
        ("moderator_id", id.moderator_id.clone()),
    ]
}

async fn check(resp: Response) -> Result<Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_owned))
        .unwrap_or(body);
    let detail = format!("HTTP {status}: {message}");
    Err(match status {
        StatusCode::UNAUTHORIZED => TransportError::AuthExpired(detail),
        StatusCode::TOO_MANY_REQUESTS => TransportError::Transient(detail),
        StatusCode::NOT_FOUND => TransportError::NotFound(detail),
        s if s.is_server_error() => TransportError::Transient(detail),
        _ => TransportError::Rejected(detail),
    })
}

async fn decode<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, TransportError> {
    resp.json()
        .await
        .map_err(|e| TransportError::Transient(format!("bad helix response: {e}")))
}

/// Cut `text` to at most `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 500), "short");
        assert_eq!(truncate_chars(&"x".repeat(600), MAX_TEXT_CHARS).len(), 500);
    }
}
