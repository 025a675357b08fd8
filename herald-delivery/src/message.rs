//! A single pending send and its lifecycle.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::{
    error::{DeliveryError, ValidationError},
    sink::{Sink, SinkReceipt},
};

/// Priority given to messages that do not ask for one.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Retry budget of a message built outside a pipeline.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(Ulid);

impl MessageId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The announcement itself. The pipeline never looks inside it beyond
/// checking that it is not empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Structured(serde_json::Value),
}

impl Content {
    /// Returns `true` if there is nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Structured(value) => match value {
                serde_json::Value::Null => true,
                serde_json::Value::String(text) => text.trim().is_empty(),
                serde_json::Value::Array(items) => items.is_empty(),
                serde_json::Value::Object(fields) => fields.is_empty(),
                serde_json::Value::Bool(_) | serde_json::Value::Number(_) => false,
            },
        }
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<serde_json::Value> for Content {
    fn from(value: serde_json::Value) -> Self {
        Self::Structured(value)
    }
}

/// Per-message delivery hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    /// Overrides the default priority; higher is serviced first.
    #[serde(default)]
    pub priority: Option<i32>,

    /// Overrides the pipeline's retry budget for this message.
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Free-form tag carried into logs and events.
    #[serde(default)]
    pub label: Option<String>,
}

impl DeliveryOptions {
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl MessageStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a producer receives once its message is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    pub sink: SinkReceipt,
    /// Number of sink invocations, the successful one included.
    pub attempts: u32,
    /// Time between admission and successful delivery.
    pub queued_for: Duration,
}

type Completion = Result<DeliveryReceipt, DeliveryError>;

/// Producer-side view of a message: resolves once the message reaches a
/// terminal state.
#[derive(Debug)]
pub struct DeliveryHandle {
    id: MessageId,
    receiver: oneshot::Receiver<Completion>,
}

impl DeliveryHandle {
    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    /// Non-blocking check: `None` while the message is still in flight.
    pub fn try_result(&mut self) -> Option<Completion> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(DeliveryError::Abandoned)),
        }
    }
}

impl Future for DeliveryHandle {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(DeliveryError::Abandoned)))
    }
}

/// Lightweight copy of a message's bookkeeping, safe to hand out while the
/// message itself stays in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    pub id: MessageId,
    pub priority: i32,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub attempts: u32,
    pub created_at: Instant,
    pub label: Option<String>,
}

/// One pending send.
pub struct Message {
    id: MessageId,
    sink: Arc<dyn Sink>,
    content: Content,
    options: DeliveryOptions,
    priority: i32,
    status: MessageStatus,
    retry_count: u32,
    max_retries: u32,
    attempts: u32,
    sequence: u64,
    created_at: Instant,
    processing_started_at: Option<Instant>,
    completed_at: Option<Instant>,
    completion: Option<oneshot::Sender<Completion>>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("sink", &self.sink.name())
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("attempts", &self.attempts)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Message {
    /// Create a pending message. Priority and retry budget come from
    /// `options` when set.
    pub fn new(
        sink: Arc<dyn Sink>,
        content: impl Into<Content>,
        options: DeliveryOptions,
        created_at: Instant,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sink,
            content: content.into(),
            priority: options.priority.unwrap_or(DEFAULT_PRIORITY),
            max_retries: options.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            options,
            status: MessageStatus::Pending,
            retry_count: 0,
            attempts: 0,
            sequence: 0,
            created_at,
            processing_started_at: None,
            completed_at: None,
            completion: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Attach a completion handle. Calling this again orphans the previous
    /// handle, which then resolves to [`DeliveryError::Abandoned`].
    pub fn completion_handle(&mut self) -> DeliveryHandle {
        let (sender, receiver) = oneshot::channel();
        self.completion = Some(sender);
        DeliveryHandle {
            id: self.id,
            receiver,
        }
    }

    pub const fn id(&self) -> MessageId {
        self.id
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    pub const fn content(&self) -> &Content {
        &self.content
    }

    pub const fn options(&self) -> &DeliveryOptions {
        &self.options
    }

    pub const fn priority(&self) -> i32 {
        self.priority
    }

    pub const fn status(&self) -> MessageStatus {
        self.status
    }

    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    pub const fn processing_started_at(&self) -> Option<Instant> {
        self.processing_started_at
    }

    pub const fn completed_at(&self) -> Option<Instant> {
        self.completed_at
    }

    pub fn label(&self) -> Option<&str> {
        self.options.label.as_deref()
    }

    /// `true` unless the message failed with its retry budget spent.
    pub const fn can_retry(&self) -> bool {
        !matches!(self.status, MessageStatus::Failed) || self.retry_count < self.max_retries
    }

    /// Returns `true` once the message reached `completed` or `failed`.
    pub const fn is_settled(&self) -> bool {
        matches!(
            self.status,
            MessageStatus::Completed | MessageStatus::Failed
        )
    }

    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            id: self.id,
            priority: self.priority,
            status: self.status,
            retry_count: self.retry_count,
            attempts: self.attempts,
            created_at: self.created_at,
            label: self.options.label.clone(),
        }
    }

    /// Check that this message may be attempted as it stands.
    ///
    /// # Errors
    ///
    /// Returns the first reason the message must not be sent.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.status {
            MessageStatus::Completed => return Err(ValidationError::AlreadyCompleted(self.id)),
            MessageStatus::Processing => return Err(ValidationError::AlreadyProcessing(self.id)),
            MessageStatus::Failed if !self.can_retry() => {
                return Err(ValidationError::RetryBudgetExhausted {
                    id: self.id,
                    retry_count: self.retry_count,
                    max_retries: self.max_retries,
                });
            }
            MessageStatus::Pending | MessageStatus::Failed => {}
        }

        if self.content.is_empty() {
            return Err(ValidationError::EmptyContent(self.id));
        }

        Ok(())
    }

    /// `pending` (or retryable `failed`) → `processing`.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] and leaves the message untouched if it
    /// must not be attempted.
    pub fn mark_processing(&mut self, now: Instant) -> Result<(), ValidationError> {
        self.validate()?;
        self.status = MessageStatus::Processing;
        self.processing_started_at = Some(now);
        self.attempts = self.attempts.saturating_add(1);
        Ok(())
    }

    /// `processing` → `pending`, for a message going back into the queue.
    pub const fn mark_pending(&mut self) {
        if matches!(self.status, MessageStatus::Processing) {
            self.status = MessageStatus::Pending;
        }
    }

    /// Count one transient failure against the retry budget and return the
    /// new count. Never exceeds `max_retries`.
    pub fn record_failure(&mut self) -> u32 {
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
        }
        self.retry_count
    }

    /// Settle the message as delivered. No effect once settled.
    pub fn mark_completed(&mut self, receipt: SinkReceipt, now: Instant) -> DeliveryReceipt {
        let delivered = DeliveryReceipt {
            message_id: self.id,
            sink: receipt,
            attempts: self.attempts,
            queued_for: now.saturating_duration_since(self.created_at),
        };

        if self.is_settled() {
            return delivered;
        }

        self.status = MessageStatus::Completed;
        self.completed_at = Some(now);

        if let Some(sender) = self.completion.take() {
            // The producer may have dropped its handle; nothing to tell then.
            let _ = sender.send(Ok(delivered.clone()));
        }

        delivered
    }

    /// Settle the message as failed, rejecting its handle with `error`.
    /// No effect once completed.
    pub fn mark_failed(&mut self, error: DeliveryError, now: Instant) {
        if matches!(self.status, MessageStatus::Completed) {
            return;
        }

        self.status = MessageStatus::Failed;
        self.completed_at = Some(now);

        if let Some(sender) = self.completion.take() {
            let _ = sender.send(Err(error));
        }
    }
}
