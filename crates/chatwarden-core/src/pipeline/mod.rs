//! The moderation pipeline.
//!
//! [`Pipeline::run`] wires the stages together:
//!
//! ```text
//! inbound ──► BatchCollector ──► Coordinator ──► outbound ──► ActionDispatcher ──► ActionSink
//!                                   │    ▲                        ▲
//!                                   │    └── RateLimiter          │
//!                                   └──► EscalationTracker ───────┘
//! ```
//!
//! Closed batches go onto a bounded queue that the coordinator drains one
//! batch at a time. When the coordinator falls behind, intake stops
//! reading the inbound channel once that queue is full; the chat session
//! sheds what it cannot queue rather than stall its socket. On shutdown
//! every budget wait is bounded by a short grace period, the open batch is
//! flushed, each stage finishes what it already holds and a loss report is
//! returned.

pub mod coordinator;
pub mod dispatcher;
pub mod stats;
pub mod traits;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chatwarden_llm::ClassificationClient;
use chatwarden_llm::retry::RetryConfig;
use chatwarden_types::config::Config;
use chatwarden_types::event::{ChatMessage, Decision, OutboundAction};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BatchCollector, Submitted};
use crate::escalation::history::HistoryStore;
use crate::escalation::{EscalationPolicy, EscalationTracker};
use crate::rate_limiter::{RateLimiter, TokenBudget};

pub use coordinator::Coordinator;
pub use dispatcher::ActionDispatcher;
pub use stats::{PipelineReport, PipelineStats};
pub use traits::{ActionSink, ContextSource, StaticContext};

/// Closed batches waiting for the coordinator.
const BATCH_QUEUE: usize = 4;

pub struct Pipeline {
    config: Config,
    client: ClassificationClient,
    sink: Arc<dyn ActionSink>,
    context: Arc<dyn ContextSource>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(config: &Config, client: ClassificationClient, sink: Arc<dyn ActionSink>) -> Self {
        Self {
            config: config.clone(),
            client,
            sink,
            context: Arc::new(StaticContext::default()),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn with_context(mut self, context: Arc<dyn ContextSource>) -> Self {
        self.context = context;
        self
    }

    /// Live counters, readable while the pipeline runs.
    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    fn action_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.config.pipeline.action_retries,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            ..RetryConfig::default()
        }
    }

    /// Moderate `inbound` until it closes or `shutdown` fires, then drain
    /// every stage and return the loss report.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<ChatMessage>,
        shutdown: CancellationToken,
    ) -> PipelineReport {
        let pipeline = &self.config.pipeline;
        let capacity = pipeline.queue_capacity.max(1);

        // The limiter outlives intake so the final flush can still reserve
        // tokens.
        let limiter_stop = CancellationToken::new();
        let (limiter, limiter_task) =
            RateLimiter::spawn(TokenBudget::new(pipeline.tokens_per_minute), limiter_stop.clone());

        let mut tracker = EscalationTracker::new(EscalationPolicy::new(self.config.escalation.clone()));
        if let Some(path) = &self.config.escalation.history_path {
            tracker = tracker.with_store(HistoryStore::new(path));
        }
        let (tracker_handle, mut decisions, tracker_task) = tracker.spawn(capacity);

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundAction>(capacity);
        let dispatcher_task = ActionDispatcher::new(
            self.sink.clone(),
            self.action_retry(),
            self.stats.clone(),
            shutdown.clone(),
        )
        .spawn(outbound_rx);

        let forward_tx = outbound_tx.clone();
        let forwarder_task = tokio::spawn(async move {
            while let Some(decision) = decisions.recv().await {
                if let Decision::Action(decision) = decision
                    && forward_tx
                        .send(OutboundAction::from_decision(&decision))
                        .await
                        .is_err()
                {
                    warn!(user = %decision.user, "action queue closed, dropping escalation");
                }
            }
        });

        let (batch_tx, batch_rx) = mpsc::channel(BATCH_QUEUE);
        let coordinator = Coordinator {
            client: self.client.clone(),
            limiter,
            tracker: tracker_handle,
            outbound: outbound_tx,
            context: self.context.clone(),
            stats: self.stats.clone(),
            max_content_size: pipeline.max_content_size,
            shutdown: shutdown.clone(),
            flush_by: OnceLock::new(),
        };
        let coordinator_task = tokio::spawn(coordinator.run(batch_rx));

        info!(
            mode = ?self.client.mode(),
            interval_secs = pipeline.batch_interval_secs,
            max_content_size = pipeline.max_content_size,
            tokens_per_minute = pipeline.tokens_per_minute,
            "pipeline started"
        );

        let mut collector = BatchCollector::from_config(pipeline);
        // A closed batch the queue had no room for when shutdown fired.
        let mut held = Vec::new();
        loop {
            let deadline = collector.next_deadline().map(tokio::time::Instant::from_std);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, flushing");
                    break;
                }
                msg = inbound.recv() => match msg {
                    Some(msg) => self.accept(&mut collector, msg),
                    None => {
                        info!("inbound stream closed, flushing");
                        break;
                    }
                },
                _ = sleep_until_opt(deadline), if deadline.is_some() => {}
            }
            while let Some(batch) = collector.poll() {
                let slot = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        held.push(batch);
                        break;
                    }
                    slot = batch_tx.reserve() => slot,
                };
                match slot {
                    Ok(slot) => slot.send(batch),
                    Err(_) => {
                        warn!("coordinator stopped early");
                        break;
                    }
                }
            }
        }

        // Messages already buffered on the inbound channel still count.
        inbound.close();
        while let Some(msg) = inbound.recv().await {
            self.accept(&mut collector, msg);
        }
        // The coordinator bounds its budget waits once shutdown is set, so
        // these sends finish within the flush grace.
        for batch in held.into_iter().chain(collector.drain()) {
            if batch_tx.send(batch).await.is_err() {
                break;
            }
        }
        drop(batch_tx);

        join("coordinator", coordinator_task).await;
        join("escalation tracker", tracker_task).await;
        join("decision forwarder", forwarder_task).await;
        join("action dispatcher", dispatcher_task).await;
        limiter_stop.cancel();
        join("rate limiter", limiter_task).await;

        let report = self.stats.report();
        if report.not_moderated > 0 {
            warn!(
                not_moderated = report.not_moderated,
                sample = ?report.not_moderated_sample,
                "some messages were not moderated"
            );
        }
        info!(%report, "pipeline stopped");
        report
    }

    fn accept<C: crate::clock::Clock>(&self, collector: &mut BatchCollector<C>, msg: ChatMessage) {
        self.stats.record_received();
        match collector.submit(msg) {
            Submitted::Added | Submitted::Rolled => {}
            Submitted::Oversize { message_id, size } => {
                warn!(%message_id, size, "message too large to moderate");
                self.stats.record_not_moderated([message_id.as_str()]);
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn join(name: &str, task: tokio::task::JoinHandle<()>) {
    match task.await {
        Ok(()) => debug!(task = name, "stopped"),
        Err(e) => warn!(task = name, error = %e, "task failed"),
    }
}
