//! Twitch chat transport.
//!
//! - [`irc`]: IRCv3 line parsing for the chat socket
//! - [`helix`]: the Helix REST client used for moderation commands
//! - [`auth`]: token providers, static and refreshing
//! - [`session`]: the reconnecting session tying them together

pub mod auth;
pub mod helix;
pub mod irc;
pub mod session;

pub use auth::{RefreshingTokenProvider, StaticTokenProvider, TokenProvider};
pub use helix::HelixClient;
pub use session::TwitchSession;
