//! The outbound action queue consumer.
//!
//! Every moderation command passes through one [`ActionDispatcher`] task,
//! so commands reach the transport in the order they were queued. Transient
//! failures are retried with exponential backoff; once the retries are spent,
//! or when the transport rejects the command outright, the action is logged
//! and abandoned and the queue moves on.

use std::sync::Arc;

use chatwarden_llm::retry::{RetryConfig, compute_delay};
use chatwarden_types::event::OutboundAction;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stats::PipelineStats;
use super::traits::ActionSink;

pub struct ActionDispatcher {
    sink: Arc<dyn ActionSink>,
    retry: RetryConfig,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
}

impl ActionDispatcher {
    pub fn new(
        sink: Arc<dyn ActionSink>,
        retry: RetryConfig,
        stats: Arc<PipelineStats>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sink,
            retry,
            stats,
            shutdown,
        }
    }

    /// Consume `rx` until every sender is dropped.
    pub fn spawn(self, rx: mpsc::Receiver<OutboundAction>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    async fn run(self, mut rx: mpsc::Receiver<OutboundAction>) {
        while let Some(action) = rx.recv().await {
            let delivered = self.deliver(&action).await;
            self.stats.record_action(delivered);
        }
        debug!("action queue closed, dispatcher exiting");
    }

    /// Try `action` up to `max_retries + 1` times. After shutdown is
    /// requested a failed attempt is not retried.
    pub async fn deliver(&self, action: &OutboundAction) -> bool {
        let attempts = self.retry.max_retries + 1;
        for attempt in 0..attempts {
            let err = match self.sink.send(action).await {
                Ok(()) => {
                    info!(
                        user = %action.user,
                        action = action.label(),
                        reason = %action.reason,
                        "action carried out"
                    );
                    return true;
                }
                Err(e) => e,
            };

            let last = attempt + 1 == attempts;
            if !err.is_retryable() || last || self.shutdown.is_cancelled() {
                error!(
                    user = %action.user,
                    action = action.label(),
                    attempts = attempt + 1,
                    error = %err,
                    "action abandoned"
                );
                return false;
            }

            let delay = compute_delay(&self.retry, attempt);
            warn!(
                user = %action.user,
                action = action.label(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "action failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
        false
    }
}
