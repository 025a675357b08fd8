use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use herald_common::{Signal, internal, logging, tracing};
use herald_delivery::{
    DeliveryOptions, DeliveryPipeline, PipelineConfig, PipelineMetrics, ShutdownReport, Sink,
};
use herald_metrics::MetricsConfig;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    sync::broadcast,
};

use crate::console_sink::{ConsoleConfig, ConsoleSink};

/// Lines starting with this marker skip the queue.
pub const IMMEDIATE_PREFIX: char = '!';

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Herald {
    #[serde(default)]
    pipeline: PipelineConfig,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(alias = "sink", default)]
    console: ConsoleConfig,
    /// How long shutdown waits for the queue to drain.
    #[serde(default = "default_shutdown_timeout_ms")]
    shutdown_timeout_ms: u64,
}

const fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered, draining the queue");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    // Nobody listening is fine, the pipeline is drained by the caller.
    let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);

    Ok(())
}

/// What a single input line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command<'a> {
    Queue(&'a str),
    Immediate(&'a str),
}

fn parse_line(line: &str) -> Option<Command<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match line.strip_prefix(IMMEDIATE_PREFIX) {
        Some(rest) => {
            let rest = rest.trim_start();
            (!rest.is_empty()).then_some(Command::Immediate(rest))
        }
        None => Some(Command::Queue(line)),
    }
}

/// Feed announcements read from `input` into `pipeline`, one per line.
///
/// Returns once the input is exhausted or a shutdown is broadcast.
async fn produce(
    pipeline: DeliveryPipeline,
    sink: Arc<dyn Sink>,
    input: impl AsyncBufRead + Unpin,
    mut signal: broadcast::Receiver<Signal>,
) -> anyhow::Result<()> {
    let mut lines = input.lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = signal.recv() => {
                tracing::debug!("Producer stopping on shutdown");
                return Ok(());
            }
        };

        let Some(line) = line else {
            internal!(level = INFO, "Input closed, waiting for shutdown");
            return Ok(());
        };

        match parse_line(&line) {
            None => {}
            Some(Command::Immediate(text)) => {
                match pipeline
                    .send_immediate(Arc::clone(&sink), text, DeliveryOptions::default())
                    .await
                {
                    Ok(receipt) => {
                        internal!(level = INFO, id = %receipt.message_id, "Sent immediately");
                    }
                    Err(error) => tracing::warn!(%error, "Immediate send did not go through"),
                }
            }
            Some(Command::Queue(text)) => {
                let handle = pipeline.enqueue(Arc::clone(&sink), text, DeliveryOptions::default());
                let id = handle.id();

                tokio::spawn(async move {
                    match handle.await {
                        Ok(receipt) => {
                            internal!(
                                level = INFO,
                                id = %receipt.message_id,
                                attempts = receipt.attempts,
                                "Delivered"
                            );
                        }
                        Err(error) => tracing::warn!(%id, %error, "Delivery failed"),
                    }
                });
            }
        }
    }
}

fn log_summary(report: &ShutdownReport, metrics: &PipelineMetrics) {
    internal!(
        level = INFO,
        drained = report.drained,
        stopped = report.stopped,
        cleared = report.cleared,
        elapsed = ?report.elapsed,
        "Pipeline shut down"
    );
    internal!(
        level = INFO,
        accepted = metrics.accepted,
        succeeded = metrics.succeeded,
        failed = metrics.failed,
        retries = metrics.retries,
        rate_limit_signals = metrics.rate_limit_signals,
        success_rate = ?metrics.success_rate(),
        "Final delivery metrics"
    );
}

impl Herald {
    pub const fn pipeline_config(&self) -> &PipelineConfig {
        &self.pipeline
    }

    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Run the pipeline against stdin until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Fails if metrics cannot be initialised, the pipeline configuration is
    /// invalid, or the signal handlers cannot be installed.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        herald_metrics::init_metrics(&self.metrics)?;

        let pipeline = DeliveryPipeline::new(self.pipeline.clone())?;
        let sink: Arc<dyn Sink> = Arc::new(ConsoleSink::stdout(&self.console));

        internal!(level = INFO, sink = sink.name(), "Controller running");

        let producer = tokio::spawn(produce(
            pipeline.clone(),
            Arc::clone(&sink),
            BufReader::new(tokio::io::stdin()),
            SHUTDOWN_BROADCAST.subscribe(),
        ));

        let ret = shutdown().await;

        internal!("Shutting down...");

        producer.abort();
        let report = pipeline.shutdown(self.shutdown_timeout()).await;
        log_summary(&report, &pipeline.metrics());

        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);

        ret
    }
}
