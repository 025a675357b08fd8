//! Rate-limited priority delivery pipeline for outbound announcements
//!
//! This crate provides:
//! - A priority queue of pending messages with deferred retries
//! - A proactive burst budget plus a reactive cooldown on sink rate limits
//! - Bounded retries with exponential backoff for transient failures
//! - A single worker loop with start/stop/pause/drain semantics

pub mod clock;
pub mod config;
mod error;
pub mod events;
mod message;
mod metrics;
mod pipeline;
pub mod policy;
mod processor;
pub mod queue;
pub mod rate_limiter;
pub mod scheduler;
pub mod sink;

// Re-export error types
pub use error::{DeliveryError, PipelineError, RateLimitKind, ValidationError};
// Re-export message types
pub use message::{
    Content, DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, DeliveryHandle, DeliveryOptions,
    DeliveryReceipt, Message, MessageId, MessageStatus, MessageSummary,
};
// Re-export core types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, PipelineConfig};
pub use events::DeliveryEvent;
pub use metrics::PipelineMetrics;
pub use pipeline::{
    DeliveryPipeline, PipelineBuilder, PipelineState, SHUTDOWN_REASON, ShutdownReport,
};
pub use policy::RetryPolicy;
pub use processor::{Processor, ProcessorStats};
pub use queue::DeliveryQueue;
pub use rate_limiter::RateLimiter;
pub use scheduler::{AdaptiveScheduler, ImmediateScheduler, Scheduler};
pub use sink::{Headers, Sink, SinkError, SinkReceipt};
