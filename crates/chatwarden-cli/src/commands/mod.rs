//! CLI command implementations for `warden`.
//!
//! - [`run`] -- connect to chat and moderate until Ctrl+C.
//! - [`check`] -- validate the configuration and print it, secrets redacted.
//! - [`categories`] -- show the escalation policy for every category.

pub mod categories;
pub mod check;
pub mod run;
