//! Seams between the pipeline and the outside world.

use async_trait::async_trait;
use chatwarden_types::TransportError;
use chatwarden_types::event::{OutboundAction, StreamContext};

/// Carries out moderation commands. Implemented by the stream session.
#[async_trait]
pub trait ActionSink: Send + Sync {
    /// Execute `action`, then post its note to chat when it has one.
    async fn send(&self, action: &OutboundAction) -> Result<(), TransportError>;
}

/// Supplies the channel context sent along with every batch.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn stream_context(&self) -> StreamContext;
}

/// A context that never changes.
#[derive(Debug, Clone, Default)]
pub struct StaticContext(pub StreamContext);

#[async_trait]
impl ContextSource for StaticContext {
    async fn stream_context(&self) -> StreamContext {
        self.0.clone()
    }
}
