//! # chatwarden-types
//!
//! Shared type definitions for the chatwarden moderation pipeline.
//!
//! Every other chatwarden crate depends on this one. It contains:
//!
//! - **[`event`]** -- chat messages, batches, decisions and outbound actions
//! - **[`category`]** -- the fixed set of violation categories
//! - **[`error`]** -- [`TransportError`], [`ClassifyError`] and [`WardenError`]
//! - **[`config`]** -- the process-wide configuration schema
//! - **[`secret`]** -- [`SecretString`](secret::SecretString) for credentials

pub mod category;
pub mod config;
pub mod error;
pub mod event;
pub mod secret;

pub use category::Category;
pub use error::{ClassifyError, Result, TransportError, WardenError};
