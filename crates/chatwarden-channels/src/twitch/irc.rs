//! IRCv3 line parsing for Twitch chat.
//!
//! Only the subset Twitch actually sends is handled: message tags, an
//! optional prefix, a command and its parameters. [`interpret`] turns a
//! parsed line into the [`IrcEvent`] the session acts on.

use std::collections::{BTreeSet, HashMap};

use chatwarden_types::event::ChatMessage;
use chrono::{DateTime, TimeZone, Utc};

/// Capabilities requested on connect.
pub const CAPABILITIES: &str = "twitch.tv/tags twitch.tv/commands";

/// NOTICE texts Twitch sends when the token is refused.
const AUTH_FAILURES: &[&str] = &["Login authentication failed", "Improperly formatted auth"];

/// One parsed IRC line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcMessage {
    /// Parse a single line, without its trailing CRLF.
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return Err("empty line".into());
        }

        let mut tags = HashMap::new();
        if let Some(stripped) = rest.strip_prefix('@') {
            let (raw, tail) = stripped
                .split_once(' ')
                .ok_or_else(|| format!("tags without command: {line:?}"))?;
            for pair in raw.split(';').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                tags.insert(key.to_owned(), unescape_tag_value(value));
            }
            rest = tail.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (p, tail) = stripped
                .split_once(' ')
                .ok_or_else(|| format!("prefix without command: {line:?}"))?;
            prefix = Some(p.to_owned());
            rest = tail.trim_start_matches(' ');
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((c, tail)) => (c, tail),
            None => (rest, ""),
        };
        if command.is_empty() || !command.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("invalid command in {line:?}"));
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            match rest.split_once(' ') {
                Some((p, tail)) => {
                    params.push(p.to_owned());
                    rest = tail;
                }
                None => {
                    params.push(rest.to_owned());
                    break;
                }
            }
        }

        Ok(Self {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Nick part of a `nick!user@host` prefix.
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        let nick = prefix.split('!').next().unwrap_or(prefix);
        (!nick.is_empty()).then_some(nick)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Convert a `PRIVMSG` into a [`ChatMessage`].
    pub fn to_chat_message(&self) -> Result<ChatMessage, String> {
        if self.command != "PRIVMSG" {
            return Err(format!("not a PRIVMSG: {}", self.command));
        }
        let id = self.tag("id").ok_or("PRIVMSG without id tag")?;
        let user = self.nick().ok_or("PRIVMSG without sender")?;
        let text = self.params.get(1).ok_or("PRIVMSG without text")?;

        let badges: BTreeSet<String> = self
            .tag("badges")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|b| b.split('/').next())
                    .filter(|b| !b.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(ChatMessage {
            id: id.to_owned(),
            user: user.to_ascii_lowercase(),
            text: strip_action(text).to_owned(),
            timestamp: self
                .tag("tmi-sent-ts")
                .and_then(parse_millis)
                .unwrap_or_else(Utc::now),
            badges,
            tags: self.tags.clone(),
        })
    }
}

/// What a line means to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum IrcEvent {
    Chat(ChatMessage),
    Ping(String),
    /// RPL_WELCOME: the credentials were accepted.
    Welcome,
    /// The server is about to restart; reconnect now.
    Reconnect,
    AuthFailed(String),
    Other,
}

/// Parse and classify one line.
pub fn interpret(line: &str) -> Result<IrcEvent, String> {
    let msg = IrcMessage::parse(line)?;
    let event = match msg.command.as_str() {
        "PRIVMSG" => IrcEvent::Chat(msg.to_chat_message()?),
        "PING" => IrcEvent::Ping(msg.params.last().cloned().unwrap_or_default()),
        "001" => IrcEvent::Welcome,
        "RECONNECT" => IrcEvent::Reconnect,
        "NOTICE" => {
            let text = msg.params.last().map(String::as_str).unwrap_or_default();
            if AUTH_FAILURES.iter().any(|f| text.contains(f)) {
                IrcEvent::AuthFailed(text.to_owned())
            } else {
                IrcEvent::Other
            }
        }
        _ => IrcEvent::Other,
    };
    Ok(event)
}

/// Lines sent right after the socket opens.
pub fn login_lines(nick: &str, token: &str, channel: &str) -> Vec<String> {
    vec![
        format!("CAP REQ :{CAPABILITIES}"),
        format!("PASS oauth:{}", token.trim_start_matches("oauth:")),
        format!("NICK {nick}"),
        format!("JOIN #{channel}"),
    ]
}

pub fn pong(arg: &str) -> String {
    format!("PONG :{arg}")
}

/// Undo IRCv3 tag value escaping.
pub fn unescape_tag_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// `/me` messages arrive wrapped in CTCP ACTION.
fn strip_action(text: &str) -> &str {
    text.strip_prefix("\u{1}ACTION ")
        .map(|t| t.trim_end_matches('\u{1}'))
        .unwrap_or(text)
}

fn parse_millis(raw: &str) -> Option<DateTime<Utc>> {
    let ms: i64 = raw.parse().ok()?;
    Utc.timestamp_millis_opt(ms).single()
}
