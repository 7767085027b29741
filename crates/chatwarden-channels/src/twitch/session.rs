//! [`TwitchSession`]: the persistent chat connection plus the moderation
//! commands.
//!
//! Inbound chat arrives over IRC-on-WebSocket and is pushed onto an mpsc
//! channel without waiting for room. The connection is re-established with
//! exponential backoff whenever it drops; gaps are logged, never surfaced
//! as errors. Outbound
//! commands go through Helix via the [`ActionSink`] impl, and the channel's
//! game and title are served through [`ContextSource`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatwarden_core::pipeline::{ActionSink, ContextSource, PipelineStats};
use chatwarden_types::config::TwitchConfig;
use chatwarden_types::event::{ActionKind, ChatMessage, OutboundAction, StreamContext};
use chatwarden_types::secret::SecretString;
use chatwarden_types::{TransportError, WardenError};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::{RefreshingTokenProvider, StaticTokenProvider, TokenProvider};
use super::helix::HelixClient;
use super::irc::{self, IrcEvent};

/// Twitch pings about every five minutes; silence past this means the
/// socket is dead.
const READ_IDLE: Duration = Duration::from_secs(6 * 60);

/// Log every this many shed messages per connection.
const SHED_LOG_EVERY: u64 = 100;

/// Longest timeout Helix accepts (two weeks).
const MAX_TIMEOUT_SECS: u64 = 1_209_600;

/// How a single connection ended.
#[derive(Debug, PartialEq, Eq)]
enum Disconnect {
    Cancelled,
    InboundClosed,
    /// Server asked us to reconnect.
    Requested,
    Lost { welcomed: bool },
    AuthFailed { token: SecretString },
}

pub struct TwitchSession {
    config: TwitchConfig,
    channel: String,
    nick: String,
    auth: Arc<dyn TokenProvider>,
    helix: Arc<HelixClient>,
    context: Mutex<Option<(Instant, StreamContext)>>,
}

impl TwitchSession {
    pub fn new(config: TwitchConfig, auth: Arc<dyn TokenProvider>) -> Self {
        let channel = config.channel_login();
        let nick = config.nick.trim().to_ascii_lowercase();
        let helix = Arc::new(HelixClient::new(
            config.helix_url.clone(),
            config.client_id.clone(),
            channel.clone(),
            nick.clone(),
            auth.clone(),
        ));
        Self {
            config,
            channel,
            nick,
            auth,
            helix,
            context: Mutex::new(None),
        }
    }

    /// Build the session with the token provider the credentials allow:
    /// refreshing when a refresh token and client secret are present,
    /// static otherwise.
    pub fn from_config(config: &TwitchConfig) -> Result<Self, WardenError> {
        let auth: Arc<dyn TokenProvider> = match (config.refresh_token(), config.client_secret()) {
            (Some(refresh), Some(secret)) => Arc::new(RefreshingTokenProvider::new(
                config.token_url.clone(),
                config.client_id.clone(),
                secret,
                refresh,
                config.access_token(),
            )),
            _ => {
                let token = config.access_token().ok_or_else(|| {
                    WardenError::Config("twitch access token is not configured".into())
                })?;
                Arc::new(StaticTokenProvider::new(token))
            }
        };
        Ok(Self::new(config.clone(), auth))
    }

    pub fn helix(&self) -> &Arc<HelixClient> {
        &self.helix
    }

    /// Receive chat into `inbound` until `cancel` fires or the receiver is
    /// dropped. Returns an error only when the credentials are refused and
    /// cannot be refreshed.
    ///
    /// The socket is never left unread while the pipeline is busy: a
    /// message that finds `inbound` full is dropped and counted in `stats`
    /// as not moderated.
    pub async fn run(
        &self,
        inbound: mpsc::Sender<ChatMessage>,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Result<(), WardenError> {
        info!(channel = %self.channel, "twitch session starting");
        let mut attempt: u32 = 0;
        loop {
            let outcome = match self.connect_once(&inbound, &stats, &cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, attempt, "twitch connection failed");
                    Disconnect::Lost { welcomed: false }
                }
            };

            match outcome {
                Disconnect::Cancelled => break,
                Disconnect::InboundClosed => {
                    info!("inbound receiver dropped, stopping session");
                    break;
                }
                Disconnect::Requested => {
                    info!("server requested reconnect");
                    attempt = 0;
                    continue;
                }
                Disconnect::Lost { welcomed } => {
                    if welcomed {
                        attempt = 0;
                    }
                }
                Disconnect::AuthFailed { token } => {
                    if let Err(e) = self.auth.refresh(&token).await {
                        error!(error = %e, "chat login refused and token cannot be refreshed");
                        return Err(e.into());
                    }
                }
            }

            let delay = reconnect_delay(
                Duration::from_millis(self.config.reconnect_base_ms),
                Duration::from_millis(self.config.reconnect_max_ms),
                attempt,
            );
            attempt = attempt.saturating_add(1);
            warn!(delay_ms = delay.as_millis() as u64, attempt, "reconnecting to twitch chat");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(channel = %self.channel, "twitch session stopped");
        Ok(())
    }

    async fn connect_once(
        &self,
        inbound: &mpsc::Sender<ChatMessage>,
        stats: &PipelineStats,
        cancel: &CancellationToken,
    ) -> Result<Disconnect, TransportError> {
        let token = self.auth.access_token().await?;
        let (ws, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(Disconnect::Cancelled),
            conn = tokio_tungstenite::connect_async(&self.config.irc_url) => {
                conn.map_err(|e| TransportError::Transient(e.to_string()))?
            }
        };
        let (mut write, mut read) = ws.split();

        for line in irc::login_lines(&self.nick, token.expose(), &self.channel) {
            write
                .send(WsMessage::Text(line))
                .await
                .map_err(|e| TransportError::Transient(e.to_string()))?;
        }
        debug!(channel = %self.channel, "sent login and join");

        let mut welcomed = false;
        let mut shed: u64 = 0;
        let mut last_seen = Instant::now();
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.close().await;
                    return Ok(Disconnect::Cancelled);
                }
                _ = tokio::time::sleep_until(last_seen + READ_IDLE) => {
                    warn!("no traffic from twitch, assuming the connection is dead");
                    return Ok(Disconnect::Lost { welcomed });
                }
                frame = read.next() => frame,
            };
            last_seen = Instant::now();

            let text = match frame {
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(WsMessage::Close(reason))) => {
                    info!(?reason, "twitch closed the connection");
                    return Ok(Disconnect::Lost { welcomed });
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "websocket error");
                    return Ok(Disconnect::Lost { welcomed });
                }
                None => return Ok(Disconnect::Lost { welcomed }),
            };

            for line in text.split("\r\n").filter(|l| !l.is_empty()) {
                let event = match irc::interpret(line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed chat line");
                        continue;
                    }
                };
                match event {
                    IrcEvent::Chat(msg) => {
                        if !self.accept(&msg) {
                            continue;
                        }
                        match inbound.try_send(msg) {
                            Ok(()) => {}
                            Err(TrySendError::Full(msg)) => {
                                shed += 1;
                                stats.record_received();
                                stats.record_not_moderated([msg.id.as_str()]);
                                if shed == 1 || shed % SHED_LOG_EVERY == 0 {
                                    warn!(shed, "pipeline is behind, dropping chat messages");
                                }
                            }
                            Err(TrySendError::Closed(_)) => {
                                let _ = write.close().await;
                                return Ok(Disconnect::InboundClosed);
                            }
                        }
                    }
                    IrcEvent::Ping(arg) => {
                        write
                            .send(WsMessage::Text(irc::pong(&arg)))
                            .await
                            .map_err(|e| TransportError::Transient(e.to_string()))?;
                    }
                    IrcEvent::Welcome => {
                        welcomed = true;
                        info!(channel = %self.channel, nick = %self.nick, "connected to twitch chat");
                    }
                    IrcEvent::Reconnect => {
                        let _ = write.close().await;
                        return Ok(Disconnect::Requested);
                    }
                    IrcEvent::AuthFailed(notice) => {
                        warn!(%notice, "twitch refused the chat login");
                        return Ok(Disconnect::AuthFailed { token });
                    }
                    IrcEvent::Other => {}
                }
            }
        }
    }

    /// Learn the sender's id and decide whether the message is moderated.
    fn accept(&self, msg: &ChatMessage) -> bool {
        if let Some(id) = msg.user_id() {
            self.helix.remember_user(&msg.user, id);
        }
        if msg.user == self.nick {
            return false;
        }
        if msg.is_privileged() {
            debug!(user = %msg.user, "skipping message from channel staff");
            return false;
        }
        true
    }
}

#[async_trait]
impl ActionSink for TwitchSession {
    async fn send(&self, action: &OutboundAction) -> Result<(), TransportError> {
        match &action.kind {
            ActionKind::Delete { message_id } => self.helix.delete_message(message_id).await?,
            ActionKind::Warn => {
                let user_id = self.helix.user_id(&action.user).await?;
                self.helix.warn(&user_id, &action.reason).await?;
            }
            ActionKind::Timeout { seconds } => {
                let user_id = self.helix.user_id(&action.user).await?;
                let seconds = (*seconds).clamp(1, MAX_TIMEOUT_SECS);
                self.helix
                    .ban(&user_id, Some(seconds), &action.reason)
                    .await?;
            }
            ActionKind::Ban => {
                let user_id = self.helix.user_id(&action.user).await?;
                self.helix.ban(&user_id, None, &action.reason).await?;
            }
        }

        // The command already went through; a lost note is not worth a retry.
        if let Some(note) = &action.note
            && let Err(e) = self
                .helix
                .send_chat(&format!("@{} {}", action.user, note))
                .await
        {
            warn!(user = %action.user, error = %e, "could not post moderation note");
        }
        Ok(())
    }
}

#[async_trait]
impl ContextSource for TwitchSession {
    async fn stream_context(&self) -> StreamContext {
        let max_age = Duration::from_secs(self.config.context_refresh_secs);
        let mut cached = self.context.lock().await;
        if let Some((fetched, ctx)) = cached.as_ref()
            && fetched.elapsed() < max_age
        {
            return ctx.clone();
        }
        match self.helix.channel_info().await {
            Ok(ctx) => {
                debug!(game = ?ctx.game, title = ?ctx.title, "refreshed channel context");
                *cached = Some((Instant::now(), ctx.clone()));
                ctx
            }
            Err(e) => {
                warn!(error = %e, "could not fetch channel info");
                cached.as_ref().map(|(_, c)| c.clone()).unwrap_or_default()
            }
        }
    }
}

/// Exponential backoff capped at `max`, with up to 20% jitter either way.
pub fn reconnect_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let ceiling = backoff_ceiling(base, max, attempt);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    ceiling.mul_f64(jitter).min(max)
}

fn backoff_ceiling(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(max)
}
