//! A sink that prints announcements instead of posting them.
//!
//! Handy for running the pipeline locally: it behaves like a chat channel,
//! including an optional rate limit of its own, so the pipeline's reactive
//! handling can be watched without a real remote.

use std::time::Duration;

use async_trait::async_trait;
use herald_common::outgoing;
use herald_delivery::{Content, DeliveryOptions, Headers, Sink, SinkError, SinkReceipt};
use serde::Deserialize;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
    time::Instant,
};

/// Limit the console enforces on itself, mimicking a remote channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ConsoleRateLimit {
    /// Sends accepted per window before answering with a rate limit.
    pub max_messages: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub rate_limit: Option<ConsoleRateLimit>,
}

fn default_name() -> String {
    "console".to_string()
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            rate_limit: None,
        }
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    sent: u32,
}

pub struct ConsoleSink {
    name: String,
    rate_limit: Option<ConsoleRateLimit>,
    window: Mutex<Window>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    posted: std::sync::atomic::AtomicU64,
}

impl std::fmt::Debug for ConsoleSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleSink")
            .field("name", &self.name)
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

impl ConsoleSink {
    /// A console sink writing to stdout.
    pub fn stdout(config: &ConsoleConfig) -> Self {
        Self::with_writer(config, tokio::io::stdout())
    }

    pub fn with_writer(
        config: &ConsoleConfig,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: config.name.clone(),
            rate_limit: config.rate_limit,
            window: Mutex::new(Window {
                started: Instant::now(),
                sent: 0,
            }),
            writer: Mutex::new(Box::new(writer)),
            posted: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Takes a slot in the current window, or reports how long until the
    /// next window opens.
    async fn take_slot(&self) -> Result<(), SinkError> {
        let Some(limit) = self.rate_limit else {
            return Ok(());
        };

        let window_length = Duration::from_millis(limit.window_ms);
        let mut window = self.window.lock().await;
        let now = Instant::now();

        if now.duration_since(window.started) >= window_length {
            window.started = now;
            window.sent = 0;
        }

        if window.sent >= limit.max_messages {
            let remaining = window_length.saturating_sub(now.duration_since(window.started));
            let mut headers = Headers::default();
            headers.insert(
                "x-ratelimit-reset-after".to_string(),
                format!("{:.3}", remaining.as_secs_f64()),
            );

            return Err(SinkError::RateLimited {
                retry_after: None,
                reset_after: Some(remaining),
                headers,
            });
        }

        window.sent += 1;
        Ok(())
    }
}

fn render(content: &Content, options: &DeliveryOptions) -> String {
    let body = match content {
        Content::Text(text) => text.clone(),
        Content::Structured(value) => value.to_string(),
    };

    match &options.label {
        Some(label) => format!("[{label}] {body}\n"),
        None => format!("{body}\n"),
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        content: &Content,
        options: &DeliveryOptions,
    ) -> Result<SinkReceipt, SinkError> {
        self.take_slot().await?;

        let line = render(content, options);
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SinkError::Network(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| SinkError::Network(e.to_string()))?;

        let posted = self
            .posted
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        outgoing!(level = DEBUG, sink = %self.name, posted, "Announcement written");

        Ok(SinkReceipt::new(format!("{}-{posted}", self.name)))
    }
}
