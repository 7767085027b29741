//! Credentials for the chat connection and the moderation API.
//!
//! The session and the Helix client never hold a token themselves; they ask
//! a [`TokenProvider`] on every connect and request, and call
//! [`TokenProvider::refresh`] when Twitch refuses the current one.

use async_trait::async_trait;
use chatwarden_types::TransportError;
use chatwarden_types::secret::SecretString;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// The token to use right now.
    async fn access_token(&self) -> Result<SecretString, TransportError>;

    /// Replace a token Twitch refused. `rejected` is the token that failed;
    /// when another caller already replaced it, the newer token is returned
    /// without a second refresh.
    async fn refresh(&self, rejected: &SecretString) -> Result<SecretString, TransportError>;
}

/// A fixed token. Refresh always fails.
pub struct StaticTokenProvider {
    token: SecretString,
}

impl StaticTokenProvider {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<SecretString, TransportError> {
        Ok(self.token.clone())
    }

    async fn refresh(&self, _rejected: &SecretString) -> Result<SecretString, TransportError> {
        Err(TransportError::AuthExpired(
            "access token refused and no refresh token configured".into(),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Exchanges a refresh token at the OAuth token endpoint.
///
/// Concurrent refreshes are serialized; callers that were waiting get the
/// token the first one obtained. A rotated refresh token replaces the old
/// one in memory.
pub struct RefreshingTokenProvider {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    refresh_token: RwLock<SecretString>,
    access_token: RwLock<Option<SecretString>>,
    refreshing: Mutex<()>,
}

impl RefreshingTokenProvider {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
        refresh_token: SecretString,
        initial: Option<SecretString>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            refresh_token: RwLock::new(refresh_token),
            access_token: RwLock::new(initial.filter(|t| !t.is_empty())),
            refreshing: Mutex::new(()),
        }
    }

    async fn exchange(&self) -> Result<SecretString, TransportError> {
        let refresh_token = self.refresh_token.read().clone();
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose()),
            ])
            .send()
            .await
            .map_err(|e| TransportError::Transient(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(TransportError::Transient(format!(
                "token endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let reason = body
                .get("message")
                .or_else(|| body.get("error_description"))
                .or_else(|| body.get("error"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(TransportError::AuthExpired(format!(
                "token refresh failed ({status}): {reason}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| TransportError::AuthExpired(format!("bad token response: {e}")))?;
        if let Some(rotated) = body.refresh_token.filter(|t| !t.is_empty()) {
            *self.refresh_token.write() = SecretString::new(rotated);
        }
        info!(expires_in = ?body.expires_in, "access token refreshed");
        Ok(SecretString::new(body.access_token))
    }
}

#[async_trait]
impl TokenProvider for RefreshingTokenProvider {
    async fn access_token(&self) -> Result<SecretString, TransportError> {
        let current = self.access_token.read().clone();
        match current {
            Some(token) => Ok(token),
            None => self.refresh(&SecretString::default()).await,
        }
    }

    async fn refresh(&self, rejected: &SecretString) -> Result<SecretString, TransportError> {
        let _guard = self.refreshing.lock().await;
        let current = self.access_token.read().clone();
        if let Some(token) = current
            && &token != rejected
        {
            debug!("token already refreshed by another caller");
            return Ok(token);
        }
        match self.exchange().await {
            Ok(token) => {
                *self.access_token.write() = Some(token.clone());
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "could not refresh access token");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_cannot_refresh() {
        let p = StaticTokenProvider::new("abc".into());
        assert_eq!(p.access_token().await.unwrap().expose(), "abc");
        let err = p.refresh(&"abc".into()).await.unwrap_err();
        assert!(matches!(err, TransportError::AuthExpired(_)));
    }

    #[tokio::test]
    async fn newer_token_is_returned_without_exchange() {
        // The token URL is unroutable; reaching it would fail the test.
        let p = RefreshingTokenProvider::new(
            "http://127.0.0.1:9/token",
            "client",
            "secret".into(),
            "refresh".into(),
            Some("fresh".into()),
        );
        let token = p.refresh(&"stale".into()).await.unwrap();
        assert_eq!(token.expose(), "fresh");
    }
}
