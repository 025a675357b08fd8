//! The destination side of the pipeline.
//!
//! A [`Sink`] is whatever actually publishes an announcement (a chat channel,
//! a webhook). The pipeline never owns or mutates it; it only calls
//! [`Sink::send`] and classifies the [`SinkError`] it gets back.

use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Content, DeliveryOptions};

/// Response headers attached to a sink failure, keyed by header name.
pub type Headers = HashMap<String, String, ahash::RandomState>;

/// What the sink hands back for a successful send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkReceipt {
    /// Identifier assigned by the remote side (e.g. the posted message id).
    pub remote_id: Option<String>,
}

impl SinkReceipt {
    #[must_use]
    pub fn new(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: Some(remote_id.into()),
        }
    }
}

/// Errors a sink may report.
///
/// `RateLimited` (or an HTTP 429) is the distinguished rate-limit signal;
/// network failures, timeouts, 408 and 5xx are transient; everything else is
/// permanent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The sink refused the send because of its own rate limit.
    #[error("Rate limited by sink")]
    RateLimited {
        /// Explicit retry-after hint.
        retry_after: Option<Duration>,
        /// Alternate hint some platforms report instead of `retry_after`.
        reset_after: Option<Duration>,
        headers: Headers,
    },

    /// The sink answered with a non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        headers: Headers,
    },

    /// The request never reached the sink or the connection dropped.
    #[error("Network error: {0}")]
    Network(String),

    /// The sink did not answer in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The sink permanently refused the content (missing permissions,
    /// unknown channel, ...).
    #[error("Rejected by sink: {0}")]
    Rejected(String),

    /// The content cannot be represented by this sink.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl SinkError {
    /// A bare HTTP error without headers.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            headers: Headers::default(),
        }
    }

    /// A rate-limit error carrying only an explicit retry-after hint.
    #[must_use]
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            retry_after,
            reset_after: None,
            headers: Headers::default(),
        }
    }

    /// Returns `true` if the sink reported its own rate limit.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Http { status: 429, .. }
        )
    }

    /// Returns `true` if a later attempt may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => *status == 408 || (*status >= 500 && *status < 600),
            Self::RateLimited { .. } | Self::Rejected(_) | Self::InvalidPayload(_) => false,
        }
    }

    /// Headers attached to this error, if any.
    #[must_use]
    pub const fn headers(&self) -> Option<&Headers> {
        match self {
            Self::RateLimited { headers, .. } | Self::Http { headers, .. } => Some(headers),
            _ => None,
        }
    }

    /// Short, low-cardinality label for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Http { .. } => "http",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Rejected(_) => "rejected",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }
}

/// A destination announcements are delivered to.
#[async_trait]
pub trait Sink: Send + Sync + fmt::Debug {
    /// Human readable name used in logs.
    fn name(&self) -> &str;

    /// Publish `content`.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] describing why the content was not published.
    async fn send(
        &self,
        content: &Content,
        options: &DeliveryOptions,
    ) -> Result<SinkReceipt, SinkError>;
}
