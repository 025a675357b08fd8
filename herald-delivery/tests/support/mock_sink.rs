//! Scriptable sink for pipeline tests
//!
//! Replays a script of outcomes, then falls back to success (or to a fixed
//! failure), while recording what it was asked to send.
#![allow(dead_code)] // Test utility module - not all methods used in every test
//!
//! # Example
//!
//! ```rust,ignore
//! let sink = MockSink::builder()
//!     .then_fail(SinkError::rate_limited(Some(Duration::from_secs(2))))
//!     .then_succeed()
//!     .build();
//! ```

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use herald_delivery::{Content, DeliveryOptions, Sink, SinkError, SinkReceipt};
use parking_lot::Mutex;

#[derive(Debug)]
pub struct MockSink {
    name: String,
    script: Mutex<VecDeque<Result<(), SinkError>>>,
    fallback: Option<SinkError>,
    latency: Option<Duration>,
    attempts: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockSink {
    pub fn builder() -> MockSinkBuilder {
        MockSinkBuilder::default()
    }

    /// A sink that accepts everything.
    pub fn succeeding() -> Arc<Self> {
        Self::builder().build()
    }

    /// A sink that fails every send with `error`.
    pub fn failing(error: SinkError) -> Arc<Self> {
        Self::builder().always_fail(error).build()
    }

    /// Number of `send` calls so far.
    pub fn calls(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Contents of every `send` call, in call order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    /// Contents of successful sends, in delivery order.
    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }

    /// Highest number of concurrent `send` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn text(content: &Content) -> String {
    match content {
        Content::Text(text) => text.clone(),
        Content::Structured(value) => value.to_string(),
    }
}

#[async_trait]
impl Sink for MockSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        content: &Content,
        _options: &DeliveryOptions,
    ) -> Result<SinkReceipt, SinkError> {
        let body = text(content);
        self.attempts.lock().push(body.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone().map_or(Ok(()), Err));

        outcome.map(|()| {
            let mut delivered = self.delivered.lock();
            delivered.push(body);
            SinkReceipt::new(format!("remote-{}", delivered.len()))
        })
    }
}

/// Builder for configuring a `MockSink`
#[derive(Debug)]
pub struct MockSinkBuilder {
    name: String,
    script: VecDeque<Result<(), SinkError>>,
    fallback: Option<SinkError>,
    latency: Option<Duration>,
}

impl Default for MockSinkBuilder {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            script: VecDeque::new(),
            fallback: None,
            latency: None,
        }
    }
}

impl MockSinkBuilder {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Fail the next unscripted send with `error`.
    pub fn then_fail(mut self, error: SinkError) -> Self {
        self.script.push_back(Err(error));
        self
    }

    pub fn then_succeed(mut self) -> Self {
        self.script.push_back(Ok(()));
        self
    }

    /// Fail every send once the script runs out.
    pub fn always_fail(mut self, error: SinkError) -> Self {
        self.fallback = Some(error);
        self
    }

    /// Hold every send for `latency` (tokio time).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn build(self) -> Arc<MockSink> {
        Arc::new(MockSink {
            name: self.name,
            script: Mutex::new(self.script),
            fallback: self.fallback,
            latency: self.latency,
            attempts: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }
}
