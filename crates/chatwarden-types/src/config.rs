//! Configuration schema.
//!
//! All settings are read once at startup and never change afterwards.
//! Every field has a serde default so a config file only needs the
//! credentials and the channel name. Keys may be written in snake_case or
//! camelCase.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::category::Category;
use crate::secret::SecretString;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub twitch: TwitchConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,
}

impl Config {
    /// Check every section. Returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.pipeline.validate()?;
        self.engine.validate()?;
        self.twitch.validate()?;
        self.escalation.validate()?;
        Ok(())
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────

/// How the classification client receives results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Create a run, then poll its status until it finishes.
    #[default]
    Poll,
    /// Stream the run and act on items as they complete.
    #[serde(alias = "stream", alias = "streaming")]
    Incremental,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Seconds a batch stays open after its first message.
    #[serde(
        default = "default_batch_interval_secs",
        alias = "batchIntervalSecs",
        alias = "batch_interval"
    )]
    pub batch_interval_secs: u64,

    /// Upper bound on the serialized request payload, in bytes.
    #[serde(
        default = "default_max_content_size",
        alias = "maxContentSize",
        alias = "max_openai_content_size"
    )]
    pub max_content_size: usize,

    /// Hard cap on messages per batch.
    #[serde(default = "default_max_batch_messages", alias = "maxBatchMessages")]
    pub max_batch_messages: usize,

    /// Rolling per-minute token budget for the engine.
    #[serde(default = "default_tokens_per_minute", alias = "tokensPerMinute")]
    pub tokens_per_minute: u32,

    /// Deadline for one classification call, in seconds.
    #[serde(
        default = "default_moderation_timeout_secs",
        alias = "moderationTimeoutSecs",
        alias = "moderation_timeout"
    )]
    pub moderation_timeout_secs: u64,

    /// Retries after the engine throttles a call.
    #[serde(default = "default_max_rate_limit_retries", alias = "maxRateLimitRetries")]
    pub max_rate_limit_retries: u32,

    #[serde(default, alias = "deliveryMode")]
    pub delivery_mode: DeliveryMode,

    /// Retries for a transport command that failed transiently.
    #[serde(default = "default_action_retries", alias = "actionRetries")]
    pub action_retries: u32,

    /// Tokens added to every estimate for the assistant's instructions.
    #[serde(default, alias = "promptOverheadTokens")]
    pub prompt_overhead_tokens: u32,

    /// Capacity of the bounded queues between workers.
    #[serde(default = "default_queue_capacity", alias = "queueCapacity")]
    pub queue_capacity: usize,
}

fn default_batch_interval_secs() -> u64 {
    2
}
fn default_max_content_size() -> usize {
    256_000
}
fn default_max_batch_messages() -> usize {
    500
}
fn default_tokens_per_minute() -> u32 {
    20_000
}
fn default_moderation_timeout_secs() -> u64 {
    60
}
fn default_max_rate_limit_retries() -> u32 {
    3
}
fn default_action_retries() -> u32 {
    3
}
fn default_queue_capacity() -> usize {
    256
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_interval_secs: default_batch_interval_secs(),
            max_content_size: default_max_content_size(),
            max_batch_messages: default_max_batch_messages(),
            tokens_per_minute: default_tokens_per_minute(),
            moderation_timeout_secs: default_moderation_timeout_secs(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            delivery_mode: DeliveryMode::default(),
            action_retries: default_action_retries(),
            prompt_overhead_tokens: 0,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl PipelineConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_interval_secs)
    }

    pub fn moderation_timeout(&self) -> Duration {
        Duration::from_secs(self.moderation_timeout_secs)
    }

    fn validate(&self) -> Result<(), String> {
        let positive = [
            ("pipeline.batch_interval_secs", self.batch_interval_secs as u128),
            ("pipeline.max_content_size", self.max_content_size as u128),
            ("pipeline.max_batch_messages", self.max_batch_messages as u128),
            ("pipeline.tokens_per_minute", self.tokens_per_minute as u128),
            (
                "pipeline.moderation_timeout_secs",
                self.moderation_timeout_secs as u128,
            ),
            ("pipeline.queue_capacity", self.queue_capacity as u128),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(format!("{name} must be greater than zero"));
            }
        }
        Ok(())
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// The external classification engine (an Assistants-style API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_base_url", alias = "baseUrl")]
    pub base_url: String,

    #[serde(default, alias = "apiKey")]
    pub api_key: SecretString,

    /// Environment variable consulted when `api_key` is empty.
    #[serde(default = "default_engine_api_key_env", alias = "apiKeyEnv")]
    pub api_key_env: Option<String>,

    /// Assistant that holds the moderation instructions.
    #[serde(default, alias = "assistantId")]
    pub assistant_id: String,

    /// Fixed conversation thread; created at startup when absent.
    #[serde(default, alias = "threadId")]
    pub thread_id: Option<String>,

    /// JSON file remembering one thread per channel across restarts.
    #[serde(default, alias = "threadMapPath")]
    pub thread_map_path: Option<PathBuf>,

    /// Interval between run status checks in poll mode.
    #[serde(default = "default_poll_interval_ms", alias = "pollIntervalMs")]
    pub poll_interval_ms: u64,

    /// Base delay of the throttling backoff.
    #[serde(default = "default_retry_base_delay_ms", alias = "retryBaseDelayMs")]
    pub retry_base_delay_ms: u64,

    /// Ceiling of the throttling backoff.
    #[serde(default = "default_retry_max_delay_ms", alias = "retryMaxDelayMs")]
    pub retry_max_delay_ms: u64,
}

fn default_engine_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_engine_api_key_env() -> Option<String> {
    Some("OPENAI_API_KEY".into())
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_engine_base_url(),
            api_key: SecretString::default(),
            api_key_env: default_engine_api_key_env(),
            assistant_id: String::new(),
            thread_id: None,
            thread_map_path: None,
            poll_interval_ms: default_poll_interval_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl EngineConfig {
    pub fn api_key(&self) -> Option<SecretString> {
        SecretString::resolve(&self.api_key, self.api_key_env.as_deref())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn validate(&self) -> Result<(), String> {
        if self.base_url.trim().is_empty() {
            return Err("engine.base_url is required".into());
        }
        if self.assistant_id.trim().is_empty() {
            return Err("engine.assistant_id is required".into());
        }
        if self.api_key().is_none() {
            return Err(format!(
                "engine api key missing: set engine.api_key or ${}",
                self.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY")
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err("engine.retry_base_delay_ms exceeds engine.retry_max_delay_ms".into());
        }
        Ok(())
    }
}

// ── Twitch ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitchConfig {
    /// Channel to moderate, with or without the leading `#`.
    #[serde(default)]
    pub channel: String,

    /// Login of the moderator account the bot runs as.
    #[serde(default, alias = "nickname")]
    pub nick: String,

    #[serde(default, alias = "clientId")]
    pub client_id: String,

    #[serde(default, alias = "clientSecret")]
    pub client_secret: SecretString,

    #[serde(default = "default_client_secret_env", alias = "clientSecretEnv")]
    pub client_secret_env: Option<String>,

    #[serde(default, alias = "accessToken")]
    pub access_token: SecretString,

    #[serde(default = "default_access_token_env", alias = "accessTokenEnv")]
    pub access_token_env: Option<String>,

    #[serde(default, alias = "refreshToken")]
    pub refresh_token: SecretString,

    #[serde(default = "default_refresh_token_env", alias = "refreshTokenEnv")]
    pub refresh_token_env: Option<String>,

    #[serde(default = "default_irc_url", alias = "ircUrl")]
    pub irc_url: String,

    #[serde(default = "default_helix_url", alias = "helixUrl")]
    pub helix_url: String,

    #[serde(default = "default_token_url", alias = "tokenUrl")]
    pub token_url: String,

    #[serde(default = "default_reconnect_base_ms", alias = "reconnectBaseMs")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms", alias = "reconnectMaxMs")]
    pub reconnect_max_ms: u64,

    /// How long fetched channel info (game, title) is reused.
    #[serde(default = "default_context_refresh_secs", alias = "contextRefreshSecs")]
    pub context_refresh_secs: u64,
}

fn default_client_secret_env() -> Option<String> {
    Some("TWITCH_CLIENT_SECRET".into())
}
fn default_access_token_env() -> Option<String> {
    Some("TWITCH_ACCESS_TOKEN".into())
}
fn default_refresh_token_env() -> Option<String> {
    Some("TWITCH_REFRESH_TOKEN".into())
}
fn default_irc_url() -> String {
    "wss://irc-ws.chat.twitch.tv:443".into()
}
fn default_helix_url() -> String {
    "https://api.twitch.tv/helix".into()
}
fn default_token_url() -> String {
    "https://id.twitch.tv/oauth2/token".into()
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_reconnect_max_ms() -> u64 {
    60_000
}
fn default_context_refresh_secs() -> u64 {
    60
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            channel: String::new(),
            nick: String::new(),
            client_id: String::new(),
            client_secret: SecretString::default(),
            client_secret_env: default_client_secret_env(),
            access_token: SecretString::default(),
            access_token_env: default_access_token_env(),
            refresh_token: SecretString::default(),
            refresh_token_env: default_refresh_token_env(),
            irc_url: default_irc_url(),
            helix_url: default_helix_url(),
            token_url: default_token_url(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            context_refresh_secs: default_context_refresh_secs(),
        }
    }
}

impl TwitchConfig {
    /// Channel login without `#`, lower-cased.
    pub fn channel_login(&self) -> String {
        self.channel.trim().trim_start_matches('#').to_ascii_lowercase()
    }

    pub fn access_token(&self) -> Option<SecretString> {
        SecretString::resolve(&self.access_token, self.access_token_env.as_deref())
    }

    pub fn refresh_token(&self) -> Option<SecretString> {
        SecretString::resolve(&self.refresh_token, self.refresh_token_env.as_deref())
    }

    pub fn client_secret(&self) -> Option<SecretString> {
        SecretString::resolve(&self.client_secret, self.client_secret_env.as_deref())
    }

    fn validate(&self) -> Result<(), String> {
        validate_login(&self.channel_login()).map_err(|e| format!("twitch.channel: {e}"))?;
        validate_login(&self.nick.trim().to_ascii_lowercase())
            .map_err(|e| format!("twitch.nick: {e}"))?;
        if self.client_id.trim().is_empty() {
            return Err("twitch.client_id is required".into());
        }
        if self.access_token().is_none() && self.refresh_token().is_none() {
            return Err("twitch credentials missing: set an access token or a refresh token".into());
        }
        if self.refresh_token().is_some() && self.client_secret().is_none() {
            return Err("twitch.client_secret is required to use a refresh token".into());
        }
        if self.reconnect_base_ms == 0 || self.reconnect_base_ms > self.reconnect_max_ms {
            return Err("twitch.reconnect_base_ms must be in 1..=reconnect_max_ms".into());
        }
        Ok(())
    }
}

/// Validate a Twitch login: 1 to 25 characters of `[a-z0-9_]`.
///
/// Logins end up inside IRC lines and URL query strings, so anything
/// outside this alphabet is refused rather than escaped.
pub fn validate_login(login: &str) -> Result<&str, String> {
    if login.is_empty() {
        return Err("empty login".into());
    }
    if login.len() > 25 {
        return Err(format!("login longer than 25 characters: {login:?}"));
    }
    if let Some(ch) = login
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(format!("login contains forbidden character {ch:?}"));
    }
    Ok(login)
}

// ── Escalation ───────────────────────────────────────────────────────

/// Outcome of a first offense in a non-zero-tolerance category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirstOffense {
    /// Record the violation, take no action against the user.
    Ignore,
    Warn,
    #[default]
    Timeout,
}

/// Effective policy for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPolicy {
    pub zero_tolerance: bool,
    /// Start one rung higher on the ladder.
    pub severe: bool,
    /// Minimum timeout issued for this category.
    pub base_timeout_secs: u64,
    pub first_offense: FirstOffense,
}

impl CategoryPolicy {
    pub fn default_for(category: Category) -> Self {
        Self {
            zero_tolerance: category.zero_tolerance_by_default(),
            severe: category.severe_by_default(),
            base_timeout_secs: 0,
            first_offense: FirstOffense::Timeout,
        }
    }
}

/// Per-category overrides; unset fields keep the built-in default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryOverride {
    #[serde(default, alias = "zeroTolerance")]
    pub zero_tolerance: Option<bool>,
    #[serde(default)]
    pub severe: Option<bool>,
    #[serde(default, alias = "baseTimeoutSecs")]
    pub base_timeout_secs: Option<u64>,
    #[serde(default, alias = "firstOffense")]
    pub first_offense: Option<FirstOffense>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Timeout lengths for successive offenses; past the last rung is a ban.
    #[serde(default = "default_ladder_secs", alias = "ladderSecs", alias = "ladder")]
    pub ladder_secs: Vec<u64>,

    /// Rolling window for counting repeat offenses.
    #[serde(default = "default_window_days", alias = "windowDays")]
    pub window_days: u32,

    #[serde(default)]
    pub categories: BTreeMap<Category, CategoryOverride>,

    /// JSON snapshot of violation history kept across restarts.
    #[serde(default, alias = "historyPath")]
    pub history_path: Option<PathBuf>,
}

fn default_ladder_secs() -> Vec<u64> {
    vec![30, 1800, 3600]
}
fn default_window_days() -> u32 {
    30
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            ladder_secs: default_ladder_secs(),
            window_days: default_window_days(),
            categories: BTreeMap::new(),
            history_path: None,
        }
    }
}

impl EscalationConfig {
    pub fn policy_for(&self, category: Category) -> CategoryPolicy {
        let mut policy = CategoryPolicy::default_for(category);
        if let Some(o) = self.categories.get(&category) {
            if let Some(v) = o.zero_tolerance {
                policy.zero_tolerance = v;
            }
            if let Some(v) = o.severe {
                policy.severe = v;
            }
            if let Some(v) = o.base_timeout_secs {
                policy.base_timeout_secs = v;
            }
            if let Some(v) = o.first_offense {
                policy.first_offense = v;
            }
        }
        policy
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.window_days))
    }

    fn validate(&self) -> Result<(), String> {
        if self.ladder_secs.is_empty() {
            return Err("escalation.ladder_secs must have at least one rung".into());
        }
        if self.ladder_secs[0] == 0 {
            return Err("escalation.ladder_secs rungs must be positive".into());
        }
        if self.ladder_secs.windows(2).any(|w| w[0] >= w[1]) {
            return Err(format!(
                "escalation.ladder_secs must be strictly increasing, got {:?}",
                self.ladder_secs
            ));
        }
        if self.window_days == 0 {
            return Err("escalation.window_days must be greater than zero".into());
        }
        Ok(())
    }
}
