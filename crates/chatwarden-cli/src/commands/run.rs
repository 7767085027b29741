//! `warden run` -- connect to Twitch and moderate until Ctrl+C.
//!
//! Wires the pieces together: the classification engine with the producer
//! chosen by `pipeline.delivery_mode`, the Twitch session as both chat
//! source and action sink, and the pipeline between them. On shutdown the
//! open batch is flushed and the loss report is printed.

use std::sync::Arc;

use anyhow::Context;
use chatwarden_channels::TwitchSession;
use chatwarden_core::Pipeline;
use chatwarden_llm::{
    AssistantsEngine, ClassificationClient, DecisionProducer, PollingProducer, RetryConfig,
    StreamingProducer,
};
use chatwarden_types::config::{Config, DeliveryMode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(config: Config) -> anyhow::Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;

    let api_key = config
        .engine
        .api_key()
        .context("no engine API key: set engine.api_key or the variable named by engine.api_key_env")?;
    let channel = config.twitch.channel_login();

    let engine = AssistantsEngine::new(&config.engine, api_key)
        .resolve_thread(&channel, config.engine.thread_map_path.as_deref())
        .await
        .context("could not resolve the conversation thread")?;
    info!(thread = engine.thread_id(), assistant = engine.assistant_id(), "engine ready");
    let engine = Arc::new(engine);

    match engine.cancel_stale_runs().await {
        Ok(0) => {}
        Ok(n) => info!(cancelled = n, "cancelled runs left over from a previous session"),
        Err(e) => warn!(error = %e, "could not check for stale runs"),
    }

    let retry = RetryConfig::from_engine(&config.engine, config.pipeline.max_rate_limit_retries);
    let producer: Arc<dyn DecisionProducer> = match config.pipeline.delivery_mode {
        DeliveryMode::Poll => Arc::new(PollingProducer::new(
            engine.clone(),
            config.engine.poll_interval(),
            retry,
        )),
        DeliveryMode::Incremental => Arc::new(StreamingProducer::new(engine.clone(), retry)),
    };
    let client = ClassificationClient::new(
        producer,
        config.pipeline.moderation_timeout(),
        config.pipeline.prompt_overhead_tokens,
    );

    let session = Arc::new(TwitchSession::from_config(&config.twitch)?);
    let pipeline = Pipeline::new(&config, client, session.clone()).with_context(session.clone());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "could not listen for Ctrl+C"),
        }
    });

    let (tx, rx) = mpsc::channel(config.pipeline.queue_capacity.max(1));
    let chat = {
        let session = session.clone();
        let stats = pipeline.stats();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { session.run(tx, stats, shutdown).await })
    };

    info!(%channel, mode = ?config.pipeline.delivery_mode, "moderating -- press Ctrl+C to stop");
    let report = pipeline.run(rx, shutdown.clone()).await;
    shutdown.cancel();

    let session_result = chat.await.context("twitch session task panicked")?;

    println!("{report}");
    if !report.not_moderated_sample.is_empty() {
        println!(
            "not moderated (sample): {}",
            report.not_moderated_sample.join(", ")
        );
    }

    session_result.context("twitch session stopped")?;
    Ok(())
}
