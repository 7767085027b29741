//! Chat transports for chatwarden.
//!
//! A transport receives chat into the pipeline and carries out the
//! moderation commands the pipeline emits. The only one shipped is
//! [`twitch`]: an IRC-on-WebSocket session for inbound chat and the Helix
//! API for commands.
//!
//! # Architecture
//!
//! ```text
//! TwitchSession::run ──ChatMessage──> mpsc ──> Pipeline
//!        │                                        │
//!   TokenProvider                        ActionSink / ContextSource
//!        │                                        │
//!   HelixClient <──────────────────── TwitchSession
//! ```

pub mod twitch;

pub use twitch::{HelixClient, StaticTokenProvider, TokenProvider, TwitchSession};
