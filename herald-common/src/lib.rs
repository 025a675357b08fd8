//! Shared plumbing for the herald workspace: logging setup, logging macros
//! and the process-wide shutdown signal.

pub mod logging;

pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
