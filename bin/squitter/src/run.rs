use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use squitter_core::{
    pipeline::{FeedPipeline, PipelineSummary},
    sink::{BlackholeSink, JsonLinesSink, Sink},
};
use squitter_io::{net::FeedConnector, shutdown::ShutdownSignal};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{FeedConfiguration, IngestConfiguration, SinkConfiguration};

/// Runs one pipeline per configured feed until every pipeline has stopped.
///
/// An interrupt signal, or a fatal error in any pipeline, stops every pipeline. Pipelines always drain their buffered
/// records before stopping.
///
/// # Errors
///
/// If the sink cannot be created, or any pipeline stopped with a fatal error, an error is returned.
pub async fn run(config: IngestConfiguration) -> Result<Vec<PipelineSummary>, anyhow::Error> {
    let sink = build_sink(&config.sink).await?;
    info!(sink = sink.name(), feeds = config.feeds.len(), "Starting feed pipelines.");

    let (shutdown, handle) = ShutdownSignal::paired();
    let mut pipelines = JoinSet::new();
    for feed in &config.feeds {
        let pipeline = build_pipeline(&config, feed, Arc::clone(&sink))?;
        pipelines.spawn(pipeline.run(shutdown.clone()));
    }

    let mut handle = Some(handle);
    let mut failure = None;
    let mut summaries = Vec::with_capacity(config.feeds.len());

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut listening = true;

    loop {
        tokio::select! {
            result = &mut interrupt, if listening => {
                listening = false;
                match result {
                    Ok(()) => {
                        info!("Received interrupt. Stopping feed pipelines.");
                        if let Some(handle) = handle.take() {
                            handle.trigger();
                        }
                    }
                    Err(e) => warn!(error = %e, "Unable to listen for interrupt signal."),
                }
            }

            maybe_result = pipelines.join_next() => {
                let result = match maybe_result {
                    Some(result) => result,
                    None => break,
                };

                match result {
                    Ok(Ok(summary)) => {
                        debug!(?summary, "Feed pipeline finished.");
                        summaries.push(summary);
                        continue;
                    }
                    Ok(Err(e)) => {
                        let source_id = e.summary().source_id;
                        error!(source_id, error = %e, "Feed pipeline failed. Stopping remaining feeds.");
                        summaries.push(e.summary().clone());
                        failure.get_or_insert(anyhow!(e));
                    }
                    Err(e) => {
                        error!(error = %e, "Feed pipeline task panicked. Stopping remaining feeds.");
                        failure.get_or_insert(anyhow!(e).context("Feed pipeline task panicked."));
                    }
                }

                if let Some(handle) = handle.take() {
                    handle.trigger();
                }
            }
        }
    }

    let written = summaries.iter().map(|summary| summary.records_written).sum::<u64>();
    info!("All feed pipelines stopped. {} records written in total.", written);

    match failure {
        Some(e) => Err(e),
        None => Ok(summaries),
    }
}

async fn build_sink(config: &SinkConfiguration) -> Result<Arc<dyn Sink>, anyhow::Error> {
    let sink: Arc<dyn Sink> = match config {
        SinkConfiguration::Jsonl { path: Some(path) } => Arc::new(
            JsonLinesSink::to_file(path)
                .await
                .with_context(|| format!("Failed to open sink file '{}'.", path.display()))?,
        ),
        SinkConfiguration::Jsonl { path: None } => Arc::new(JsonLinesSink::to_stdout()),
        SinkConfiguration::Blackhole => Arc::new(BlackholeSink::new()),
    };
    Ok(sink)
}

fn build_pipeline(
    config: &IngestConfiguration, feed: &FeedConfiguration, sink: Arc<dyn Sink>,
) -> Result<FeedPipeline, anyhow::Error> {
    let connector = FeedConnector::new(feed.host.clone(), feed.port)
        .with_attempt_limit(feed.connect_attempt_limit)
        .with_attempt_delay(feed.connect_attempt_delay)
        .with_read_timeout(feed.read_timeout)
        .with_read_buffer_size(feed.read_buffer_size);

    let pipeline = FeedPipeline::new(feed.source_id, connector, sink)
        .with_accepted(feed.accepted()?)
        .with_mlat(feed.is_mlat())
        .with_timezone(feed.timezone())
        .with_ttls(config.throttle.ttl_table()?)
        .with_idle_horizon(config.throttle.idle_eviction)
        .with_batch_size(config.batch_size)
        .with_max_batch_age(config.max_batch_age)
        .with_max_fragment_len(config.max_fragment_len)
        .with_require_position(feed.require_position);

    Ok(pipeline)
}
