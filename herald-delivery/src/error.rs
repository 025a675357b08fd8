//! Typed error handling for delivery operations.
//!
//! Errors fall into three groups:
//! - Signals (rate limits, retryable failures) - recovered by re-enqueueing,
//!   never seen by the producer
//! - Terminal failures - settle the producer's handle exactly once
//! - Pipeline errors - control-plane failures (configuration, stop timeouts)

use std::{fmt, time::Duration};

use serde::Serialize;
use thiserror::Error;

use crate::{config::ConfigError, message::MessageId, sink::SinkError};

/// Which rate-limit gate refused a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKind {
    /// Self-imposed burst budget exhausted.
    Proactive,
    /// Cooldown after the sink reported a rate limit.
    Reactive,
}

impl RateLimitKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Proactive => "proactive",
            Self::Reactive => "reactive",
        }
    }
}

impl fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message that must not be sent as it stands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Message {0} has no content")]
    EmptyContent(MessageId),

    #[error("Message {0} was already delivered")]
    AlreadyCompleted(MessageId),

    #[error("Message {0} is already being processed")]
    AlreadyProcessing(MessageId),

    #[error("Message {id} failed and has no retries left ({retry_count}/{max_retries})")]
    RetryBudgetExhausted {
        id: MessageId,
        retry_count: u32,
        max_retries: u32,
    },
}

/// Outcome of a failed delivery step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Malformed message; never retried.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A rate-limit gate refused the send; always retried.
    #[error("Rate limited ({kind}), retry after {}ms", .retry_after.as_millis())]
    RateLimited {
        kind: RateLimitKind,
        retry_after: Duration,
    },

    /// Transient sink failure with retry budget remaining.
    #[error("Retryable failure, retry in {}ms: {source}", .delay.as_millis())]
    Retryable { delay: Duration, source: SinkError },

    /// The sink's own error, surfaced once retries are not an option.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The message was removed by a queue clear.
    #[error("{reason}")]
    Cleared { reason: String },

    /// The pipeline no longer accepts work.
    #[error("Delivery pipeline is closed")]
    Closed,

    /// The message was dropped without ever settling.
    #[error("Message was dropped before it settled")]
    Abandoned,
}

impl DeliveryError {
    /// Returns `true` for rate-limit and retryable signals, which the
    /// pipeline recovers from by re-enqueueing.
    #[must_use]
    pub const fn is_signal(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Retryable { .. })
    }

    /// Returns `true` if this error settles the producer's handle.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !self.is_signal()
    }

    /// The rate-limit gate behind this error, if any.
    #[must_use]
    pub const fn rate_limit_kind(&self) -> Option<RateLimitKind> {
        match self {
            Self::RateLimited { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Short, low-cardinality label for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::RateLimited { .. } => "rate_limited",
            Self::Retryable { .. } => "retryable",
            Self::Sink(error) => error.reason(),
            Self::Cleared { .. } => "cleared",
            Self::Closed => "closed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Control-plane failures of the pipeline itself.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Worker did not stop within {}ms", .0.as_millis())]
    StopTimeout(Duration),

    #[error("Delivery pipeline is closed")]
    Closed,

    #[error("No tokio runtime available to run the delivery worker")]
    NoRuntime,
}
