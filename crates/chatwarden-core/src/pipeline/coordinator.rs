//! Classifies closed batches one at a time and applies the decisions.
//!
//! For each batch the [`Coordinator`] reserves tokens, runs the
//! classification call and turns every flagged message into a delete on the
//! outbound queue plus a violation event for the escalation tracker. In
//! incremental mode decisions that arrive before the call finishes are
//! applied right away; a per-batch set of applied message ids keeps the
//! final result from applying them a second time.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chatwarden_llm::{ClassificationClient, PreparedBatch};
use chatwarden_types::{ClassifyError, WardenError};
use chatwarden_types::event::{Batch, Decision, OutboundAction, StreamContext};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stats::PipelineStats;
use super::traits::ContextSource;
use crate::batch::split_batch;
use crate::escalation::{TrackerHandle, ViolationEvent};
use crate::rate_limiter::{Permit, RateLimiterHandle};

/// How long after shutdown queued batches may still wait for token budget.
const FLUSH_GRACE: Duration = Duration::from_secs(5);

pub struct Coordinator {
    pub(crate) client: ClassificationClient,
    pub(crate) limiter: RateLimiterHandle,
    pub(crate) tracker: TrackerHandle,
    pub(crate) outbound: mpsc::Sender<OutboundAction>,
    pub(crate) context: Arc<dyn ContextSource>,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) max_content_size: usize,
    pub(crate) shutdown: CancellationToken,
    pub(crate) flush_by: OnceLock<Instant>,
}

impl Coordinator {
    /// Process batches in arrival order until the sender is dropped.
    pub async fn run(self, mut batches: mpsc::Receiver<Batch>) {
        while let Some(batch) = batches.recv().await {
            self.process(batch).await;
        }
        debug!("batch queue closed, coordinator exiting");
    }

    async fn process(&self, batch: Batch) {
        let context = self.context.stream_context().await;
        let mut queue = VecDeque::from([batch]);
        while let Some(batch) = queue.pop_front() {
            match self.prepare(batch, &context) {
                Prepared::Ready(prepared) => self.classify(prepared).await,
                Prepared::Split(a, b) => {
                    queue.push_front(b);
                    queue.push_front(a);
                }
                Prepared::Dropped => {}
            }
        }
    }

    fn prepare(&self, batch: Batch, context: &StreamContext) -> Prepared {
        let ids: Vec<String> = batch.message_ids().map(str::to_owned).collect();
        let prepared = match self.client.prepare(batch, context) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, messages = ids.len(), "cannot prepare batch");
                self.stats.record_batch_dropped(ids.iter().map(String::as_str));
                return Prepared::Dropped;
            }
        };
        if prepared.payload_len() <= self.max_content_size {
            return Prepared::Ready(prepared);
        }

        let seq = prepared.batch.seq();
        let size = prepared.payload_len();
        match split_batch(prepared.batch) {
            Some((a, b)) => {
                warn!(
                    batch = seq,
                    size,
                    max = self.max_content_size,
                    "payload too large, splitting batch"
                );
                Prepared::Split(a, b)
            }
            None => {
                warn!(
                    batch = seq,
                    size,
                    max = self.max_content_size,
                    "single-message payload too large, dropping"
                );
                self.stats.record_batch_dropped(ids.iter().map(String::as_str));
                Prepared::Dropped
            }
        }
    }

    async fn classify(&self, prepared: PreparedBatch) {
        let seq = prepared.batch.seq();
        let messages = prepared.batch.len();

        let permit = self.reserve(prepared.estimated_tokens).await;
        let permit = match permit {
            Ok(p) => p,
            Err(e) => {
                warn!(batch = seq, messages, error = %e, "no token budget, batch not moderated");
                self.stats.record_batch_dropped(prepared.batch.message_ids());
                return;
            }
        };

        info!(
            batch = seq,
            messages,
            estimated_tokens = prepared.estimated_tokens,
            "classifying batch"
        );

        let mut applied = HashSet::new();
        let (early_tx, mut early_rx) = mpsc::unbounded_channel();
        let result = {
            let call = self.client.classify(&prepared, Some(&early_tx));
            tokio::pin!(call);
            loop {
                tokio::select! {
                    result = &mut call => break result,
                    Some(decision) = early_rx.recv() => {
                        self.apply(decision, &mut applied).await;
                    }
                }
            }
        };
        drop(early_tx);
        while let Some(decision) = early_rx.recv().await {
            self.apply(decision, &mut applied).await;
        }

        match result {
            Ok(classification) => {
                let flagged = classification.decisions.len();
                for decision in classification.decisions {
                    self.apply(decision, &mut applied).await;
                }
                self.limiter
                    .release_unused(permit, classification.usage.map(|u| u.total_tokens))
                    .await;
                self.stats.record_moderated(messages);
                info!(
                    batch = seq,
                    messages,
                    flagged,
                    dropped_items = classification.dropped,
                    streamed = classification.streamed,
                    throttled = classification.throttled,
                    "batch moderated"
                );
            }
            Err(e) => {
                let lost: Vec<&str> = prepared
                    .batch
                    .message_ids()
                    .filter(|id| !applied.contains(*id))
                    .collect();
                match &e {
                    ClassifyError::RateLimitExceeded { .. } | ClassifyError::AuthFailed(_) => {
                        error!(batch = seq, messages, error = %e, "batch dropped")
                    }
                    _ => warn!(batch = seq, messages, error = %e, "batch dropped"),
                }
                self.stats.add_moderated(messages - lost.len());
                self.stats.record_batch_dropped(lost);
            }
        }
    }

    /// Reserve budget for one call. Once shutdown is requested the wait is
    /// bounded by the shared flush deadline.
    async fn reserve(&self, tokens: u32) -> Result<Permit, WardenError> {
        let acquire = self.limiter.acquire(tokens);
        tokio::pin!(acquire);
        if !self.shutdown.is_cancelled() {
            tokio::select! {
                result = &mut acquire => return result,
                _ = self.shutdown.cancelled() => {
                    debug!(tokens, "shutdown while waiting for token budget");
                }
            }
        }
        tokio::time::timeout_at(self.flush_deadline(), acquire)
            .await
            .unwrap_or(Err(WardenError::Shutdown))
    }

    fn flush_deadline(&self) -> Instant {
        *self.flush_by.get_or_init(|| Instant::now() + FLUSH_GRACE)
    }

    /// Apply one decision at most once per message id.
    async fn apply(&self, decision: Decision, applied: &mut HashSet<String>) {
        match decision {
            Decision::Flagged(flagged) => {
                if !applied.insert(flagged.message_id.clone()) {
                    debug!(message_id = %flagged.message_id, "decision already applied");
                    return;
                }
                self.stats.record_flagged();
                info!(
                    user = %flagged.user,
                    message_id = %flagged.message_id,
                    category = %flagged.category,
                    "message flagged"
                );
                self.enqueue(OutboundAction::delete(&flagged)).await;
                let event = ViolationEvent::from_flagged(&flagged, Utc::now());
                if let Err(e) = self.tracker.report(event).await {
                    warn!(user = %flagged.user, error = %e, "escalation tracker unavailable");
                }
            }
            Decision::Action(decision) => {
                self.enqueue(OutboundAction::from_decision(&decision)).await;
            }
        }
    }

    async fn enqueue(&self, action: OutboundAction) {
        if self.outbound.send(action).await.is_err() {
            warn!("action queue closed, dropping action");
        }
    }
}

enum Prepared {
    Ready(PreparedBatch),
    Split(Batch, Batch),
    Dropped,
}
