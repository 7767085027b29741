//! # chatwarden-core
//!
//! The moderation pipeline for chatwarden.
//!
//! Contains the batch collector, the token budget actor, the escalation
//! tracker and the pipeline that ties them to a classification client and
//! an action sink.

pub mod batch;
pub mod clock;
pub mod escalation;
pub mod pipeline;
pub mod rate_limiter;

pub use batch::{BatchCollector, Submitted};
pub use escalation::{EscalationPolicy, EscalationTracker, TrackerHandle};
pub use pipeline::{ActionSink, ContextSource, Pipeline, PipelineReport, StaticContext};
pub use rate_limiter::{RateLimiter, RateLimiterHandle, TokenBudget};
