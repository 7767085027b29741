//! Classification engine client for chatwarden.
//!
//! Sends a batch of chat messages to an Assistants-style API and turns the
//! assistant's reply into typed [`Decision`](chatwarden_types::event::Decision)
//! values. Nothing untyped leaves this crate.
//!
//! # Architecture
//!
//! - [`AssistantsEngine`] wraps the HTTP endpoints (threads, messages, runs)
//! - [`DecisionProducer`] is the delivery strategy, with two implementations:
//!   [`PollingProducer`] and [`StreamingProducer`]
//! - [`ClassificationClient`] prepares payloads, enforces the per-call
//!   deadline and hands back a [`Classification`]
//! - [`retry`] holds the bounded backoff used for throttled calls
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chatwarden_llm::{AssistantsEngine, ClassificationClient, PollingProducer, RetryConfig};
//!
//! let engine = AssistantsEngine::new(&config.engine, api_key)
//!     .resolve_thread("somechannel", None)
//!     .await?;
//! let retry = RetryConfig::from_engine(&config.engine, 3);
//! let producer = Arc::new(PollingProducer::new(Arc::new(engine), config.engine.poll_interval(), retry));
//! let client = ClassificationClient::new(producer, config.pipeline.moderation_timeout(), 0);
//!
//! let prepared = client.prepare(batch, &context)?;
//! let result = client.classify(&prepared, None).await?;
//! ```

pub mod assistants;
pub mod client;
pub mod error;
pub mod parse;
pub mod payload;
pub mod producer;
pub mod retry;
pub mod sse;
pub mod types;

pub use assistants::AssistantsEngine;
pub use client::{ClassificationClient, PreparedBatch};
pub use error::{ProviderError, Result};
pub use producer::{
    Classification, ClassifyJob, DecisionProducer, PollingProducer, StreamingProducer,
};
pub use retry::RetryConfig;
pub use types::Usage;
