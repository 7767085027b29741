//! Pipeline-facing entry point for classification.

use std::sync::Arc;
use std::time::Duration;

use chatwarden_types::ClassifyError;
use chatwarden_types::config::DeliveryMode;
use chatwarden_types::event::{Batch, Decision, StreamContext};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::payload::{build_payload, estimate_tokens};
use crate::producer::{Classification, ClassifyJob, DecisionProducer};

/// Slack between the producer's own deadline and the hard outer one, so a
/// producer gets the chance to cancel its run before being dropped.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// A batch serialized and sized for the engine.
#[derive(Debug)]
pub struct PreparedBatch {
    pub batch: Batch,
    pub payload: String,
    pub estimated_tokens: u32,
}

impl PreparedBatch {
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Wraps a [`DecisionProducer`] with payload preparation and a hard deadline.
#[derive(Clone)]
pub struct ClassificationClient {
    producer: Arc<dyn DecisionProducer>,
    timeout: Duration,
    prompt_overhead_tokens: u32,
}

impl ClassificationClient {
    pub fn new(
        producer: Arc<dyn DecisionProducer>,
        timeout: Duration,
        prompt_overhead_tokens: u32,
    ) -> Self {
        Self {
            producer,
            timeout,
            prompt_overhead_tokens,
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.producer.mode()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Serialize `batch` with the channel context and estimate its tokens.
    pub fn prepare(
        &self,
        batch: Batch,
        context: &StreamContext,
    ) -> Result<PreparedBatch, ClassifyError> {
        let payload = build_payload(&batch, context)
            .map_err(|e| ClassifyError::Engine(format!("cannot serialize batch: {e}")))?;
        let estimated_tokens = estimate_tokens(&payload, self.prompt_overhead_tokens);
        Ok(PreparedBatch {
            batch,
            payload,
            estimated_tokens,
        })
    }

    /// Classify a prepared batch within the configured timeout.
    ///
    /// In incremental mode decisions may arrive on `early` before this
    /// returns; they are repeated in the result.
    pub async fn classify(
        &self,
        prepared: &PreparedBatch,
        early: Option<&mpsc::UnboundedSender<Decision>>,
    ) -> Result<Classification, ClassifyError> {
        let started = Instant::now();
        let job = ClassifyJob {
            batch: &prepared.batch,
            payload: &prepared.payload,
            deadline: started + self.timeout,
            timeout: self.timeout,
        };

        let result = tokio::time::timeout_at(
            job.deadline + CANCEL_GRACE,
            self.producer.produce(&job, early),
        )
        .await
        .unwrap_or(Err(ClassifyError::Timeout {
            after: self.timeout,
        }));

        debug!(
            batch = prepared.batch.seq(),
            mode = ?self.producer.mode(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "classification finished"
        );
        result
    }
}
