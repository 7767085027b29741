//! Decision producers: the two ways of getting a verdict out of the engine.
//!
//! Both implement [`DecisionProducer`]. [`PollingProducer`] waits for the
//! run to finish and reads the reply once. [`StreamingProducer`] reads the
//! reply as it is generated and forwards each flagged item on the `early`
//! channel as soon as it is complete, then returns the full list as well.
//!
//! A producer owns the throttling loop and the per-call deadline. When the
//! deadline passes it cancels whatever run is still active so the thread is
//! free for the next batch.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatwarden_types::ClassifyError;
use chatwarden_types::config::DeliveryMode;
use chatwarden_types::event::{Batch, Decision};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::assistants::AssistantsEngine;
use crate::error::ProviderError;
use crate::parse::{IncrementalScanner, parse_response, validate_item};
use crate::retry::{Backoff, DEFAULT_THROTTLE_HINT, RetryConfig};
use crate::sse::{SseDecoder, StreamEvent};
use crate::types::{Run, RunStatus, Usage};

/// One classification call.
#[derive(Debug)]
pub struct ClassifyJob<'a> {
    pub batch: &'a Batch,
    /// Serialized batch, as built by [`crate::payload::build_payload`].
    pub payload: &'a str,
    /// No engine work is started or waited on past this instant.
    pub deadline: Instant,
    /// The configured timeout, for error reporting.
    pub timeout: Duration,
}

/// Outcome of a successful classification call.
#[derive(Debug, Default)]
pub struct Classification {
    /// Every valid flagged item, in response order, one per message id.
    pub decisions: Vec<Decision>,
    /// Token usage summed over every run the call started.
    pub usage: Option<Usage>,
    /// Items dropped by validation.
    pub dropped: usize,
    /// Items already delivered on the early channel.
    pub streamed: usize,
    /// How many times the engine throttled this call.
    pub throttled: u32,
}

#[async_trait]
pub trait DecisionProducer: Send + Sync {
    fn mode(&self) -> DeliveryMode;

    /// Classify one batch.
    ///
    /// Implementations that can deliver items before the reply is complete
    /// send them on `early`; everything sent there also appears in the
    /// returned [`Classification::decisions`].
    async fn produce(
        &self,
        job: &ClassifyJob<'_>,
        early: Option<&mpsc::UnboundedSender<Decision>>,
    ) -> Result<Classification, ClassifyError>;
}

/// Tracks the run that must be cancelled if the deadline fires.
type ActiveRun = Mutex<Option<String>>;

/// Race `work` against the job deadline; on expiry cancel the active run.
async fn bounded<F>(
    engine: &AssistantsEngine,
    job: &ClassifyJob<'_>,
    active: &ActiveRun,
    work: F,
) -> Result<Classification, ClassifyError>
where
    F: Future<Output = Result<Classification, ClassifyError>>,
{
    match tokio::time::timeout_at(job.deadline, work).await {
        Ok(result) => {
            let abandoned = active.lock().take();
            if result.is_err()
                && let Some(run_id) = abandoned
            {
                engine.cancel_quietly(&run_id).await;
            }
            result
        }
        Err(_) => {
            let run_id = active.lock().take();
            warn!(
                batch = job.batch.seq(),
                run = run_id.as_deref().unwrap_or("-"),
                "classification deadline passed"
            );
            if let Some(run_id) = run_id {
                engine.cancel_quietly(&run_id).await;
            }
            Err(ClassifyError::Timeout { after: job.timeout })
        }
    }
}

/// Run `op` until it stops returning [`ProviderError::RateLimited`] or the
/// backoff gives up.
async fn with_backoff<T, F, Fut>(
    backoff: &mut Backoff,
    throttled: &mut u32,
    job: &ClassifyJob<'_>,
    mut op: F,
) -> Result<T, ClassifyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(ProviderError::RateLimited { retry_after_ms }) => {
                *throttled += 1;
                backoff
                    .wait(Some(Duration::from_millis(retry_after_ms)), job.deadline)
                    .await
                    .map_err(|stop| stop.into_classify_error(job.timeout))?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn run_failure(run: &Run) -> ClassifyError {
    ClassifyError::Engine(format!(
        "run {} ended {:?}: {}",
        run.id,
        run.status,
        run.error_message()
    ))
}

// ── Polling ─────────────────────────────────────────────────────────

/// Waits for each run to finish, then reads the reply in one piece.
pub struct PollingProducer {
    engine: Arc<AssistantsEngine>,
    poll_interval: Duration,
    retry: RetryConfig,
}

impl PollingProducer {
    pub fn new(engine: Arc<AssistantsEngine>, poll_interval: Duration, retry: RetryConfig) -> Self {
        Self {
            engine,
            poll_interval,
            retry,
        }
    }

    async fn run_to_end(&self, mut run: Run) -> Result<Run, ClassifyError> {
        while !run.status.is_terminal() {
            tokio::time::sleep(self.poll_interval).await;
            match self.engine.get_run(&run.id).await {
                Ok(next) => {
                    trace!(run = %next.id, status = ?next.status, "polled run");
                    run = next;
                }
                Err(ProviderError::RateLimited { retry_after_ms }) => {
                    debug!(retry_after_ms, "status poll throttled");
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(run)
    }

    async fn work(
        &self,
        job: &ClassifyJob<'_>,
        active: &ActiveRun,
    ) -> Result<Classification, ClassifyError> {
        let mut backoff = Backoff::new(self.retry.clone());
        let mut out = Classification::default();
        let mut usage = Usage::default();

        with_backoff(&mut backoff, &mut out.throttled, job, || {
            self.engine.add_message(job.payload)
        })
        .await?;

        loop {
            let run = with_backoff(&mut backoff, &mut out.throttled, job, || {
                self.engine.create_run()
            })
            .await?;
            *active.lock() = Some(run.id.clone());
            debug!(batch = job.batch.seq(), run = %run.id, "run started");

            let run = self.run_to_end(run).await?;
            active.lock().take();
            if let Some(u) = &run.usage {
                usage.add(u);
            }

            match run.status {
                RunStatus::Completed => break,
                _ if run.is_rate_limited() => {
                    out.throttled += 1;
                    let hint = run.retry_hint().unwrap_or(DEFAULT_THROTTLE_HINT);
                    backoff
                        .wait(Some(hint), job.deadline)
                        .await
                        .map_err(|stop| stop.into_classify_error(job.timeout))?;
                }
                _ => return Err(run_failure(&run)),
            }
        }

        let text = self.engine.latest_assistant_text().await?;
        let parsed = parse_response(&text, job.batch)?;
        out.decisions = parsed.decisions;
        out.dropped = parsed.dropped;
        out.usage = Some(usage);
        Ok(out)
    }
}

#[async_trait]
impl DecisionProducer for PollingProducer {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Poll
    }

    async fn produce(
        &self,
        job: &ClassifyJob<'_>,
        _early: Option<&mpsc::UnboundedSender<Decision>>,
    ) -> Result<Classification, ClassifyError> {
        let active = ActiveRun::default();
        bounded(&self.engine, job, &active, self.work(job, &active)).await
    }
}

// ── Streaming ───────────────────────────────────────────────────────

/// Reads the reply as an SSE stream and forwards items as they complete.
pub struct StreamingProducer {
    engine: Arc<AssistantsEngine>,
    retry: RetryConfig,
}

/// How one streamed run ended.
enum StreamOutcome {
    Completed { text: String },
    Throttled { hint: Duration },
}

impl StreamingProducer {
    pub fn new(engine: Arc<AssistantsEngine>, retry: RetryConfig) -> Self {
        Self { engine, retry }
    }

    async fn consume(
        &self,
        response: reqwest::Response,
        job: &ClassifyJob<'_>,
        early: Option<&mpsc::UnboundedSender<Decision>>,
        active: &ActiveRun,
        seen: &mut HashSet<String>,
        usage: &mut Usage,
    ) -> Result<StreamOutcome, ClassifyError> {
        let mut decoder = SseDecoder::new();
        let mut scanner = IncrementalScanner::new();
        let mut final_text: Option<String> = None;
        let mut completed = false;
        let mut body = response.bytes_stream();

        'read: loop {
            let (events, eof) = match body.next().await {
                Some(chunk) => {
                    let bytes = chunk
                        .map_err(|e| ClassifyError::Engine(format!("stream read error: {e}")))?;
                    (decoder.push(&bytes), false)
                }
                None => (decoder.finish().into_iter().collect::<Vec<_>>(), true),
            };

            for sse in &events {
                let event = match StreamEvent::from_sse(sse) {
                    Ok(ev) => ev,
                    Err(e) => {
                        warn!(error = %e, "skipping malformed stream event");
                        continue;
                    }
                };
                match event {
                    StreamEvent::RunCreated(run) => {
                        debug!(batch = job.batch.seq(), run = %run.id, "streamed run started");
                        *active.lock() = Some(run.id);
                    }
                    StreamEvent::TextDelta(fragment) => {
                        for item in scanner.push(&fragment) {
                            self.forward(&item, job, early, seen);
                        }
                    }
                    StreamEvent::MessageCompleted(text) => final_text = Some(text),
                    StreamEvent::RunCompleted(run) => {
                        if let Some(u) = &run.usage {
                            usage.add(u);
                        }
                        completed = true;
                    }
                    StreamEvent::RunEnded(run) => {
                        active.lock().take();
                        if let Some(u) = &run.usage {
                            usage.add(u);
                        }
                        if run.is_rate_limited() {
                            let hint = run.retry_hint().unwrap_or(DEFAULT_THROTTLE_HINT);
                            return Ok(StreamOutcome::Throttled { hint });
                        }
                        return Err(run_failure(&run));
                    }
                    StreamEvent::Error(data) => {
                        active.lock().take();
                        if data.contains("rate_limit") {
                            let hint = crate::retry::parse_try_again(&data)
                                .unwrap_or(DEFAULT_THROTTLE_HINT);
                            return Ok(StreamOutcome::Throttled { hint });
                        }
                        return Err(ClassifyError::Engine(format!("stream error: {data}")));
                    }
                    StreamEvent::Done => break 'read,
                    StreamEvent::Ignored => {}
                }
            }

            if eof {
                break;
            }
        }

        active.lock().take();
        if !completed {
            return Err(ClassifyError::Engine(
                "stream ended before the run completed".into(),
            ));
        }
        let text = final_text.unwrap_or_else(|| scanner.text().to_owned());
        Ok(StreamOutcome::Completed { text })
    }

    /// Validate one completed item and send it early, once per message id.
    fn forward(
        &self,
        item: &str,
        job: &ClassifyJob<'_>,
        early: Option<&mpsc::UnboundedSender<Decision>>,
        seen: &mut HashSet<String>,
    ) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(item) else {
            trace!(item, "incomplete or nested fragment, waiting for full reply");
            return;
        };
        let flagged = match validate_item(&value, job.batch) {
            Ok(f) => f,
            Err(reason) => {
                trace!(%reason, "streamed item not forwarded");
                return;
            }
        };
        if !seen.insert(flagged.message_id.clone()) {
            return;
        }
        debug!(
            batch = job.batch.seq(),
            message_id = %flagged.message_id,
            category = %flagged.category,
            "flagged item streamed"
        );
        if let Some(tx) = early {
            let _ = tx.send(Decision::Flagged(flagged));
        }
    }

    async fn work(
        &self,
        job: &ClassifyJob<'_>,
        early: Option<&mpsc::UnboundedSender<Decision>>,
        active: &ActiveRun,
    ) -> Result<Classification, ClassifyError> {
        let mut backoff = Backoff::new(self.retry.clone());
        let mut out = Classification::default();
        let mut usage = Usage::default();
        let mut seen = HashSet::new();

        with_backoff(&mut backoff, &mut out.throttled, job, || {
            self.engine.add_message(job.payload)
        })
        .await?;

        let text = loop {
            let response = with_backoff(&mut backoff, &mut out.throttled, job, || {
                self.engine.create_run_stream()
            })
            .await?;
            match self
                .consume(response, job, early, active, &mut seen, &mut usage)
                .await?
            {
                StreamOutcome::Completed { text } => break text,
                StreamOutcome::Throttled { hint } => {
                    out.throttled += 1;
                    backoff
                        .wait(Some(hint), job.deadline)
                        .await
                        .map_err(|stop| stop.into_classify_error(job.timeout))?;
                }
            }
        };

        let parsed = parse_response(&text, job.batch)?;
        out.streamed = seen.len();
        out.decisions = parsed.decisions;
        out.dropped = parsed.dropped;
        out.usage = Some(usage);
        if out.streamed > 0 {
            info!(
                batch = job.batch.seq(),
                streamed = out.streamed,
                total = out.decisions.len(),
                "streamed decisions delivered early"
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl DecisionProducer for StreamingProducer {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Incremental
    }

    async fn produce(
        &self,
        job: &ClassifyJob<'_>,
        early: Option<&mpsc::UnboundedSender<Decision>>,
    ) -> Result<Classification, ClassifyError> {
        let active = ActiveRun::default();
        bounded(&self.engine, job, &active, self.work(job, early, &active)).await
    }
}
