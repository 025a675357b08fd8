//! Policy abstractions for delivery operations.
//!
//! Decision logic lives here, apart from the orchestration in the processor
//! and pipeline, so it can be tested as plain functions.
//!
//! - [`RetryPolicy`]: which failures are retried and how long to wait
//! - [`backoff`]: the exponential backoff calculation itself

pub mod backoff;
pub mod retry;

pub use retry::{RetryPolicy, RetryStats};
