use std::fmt;

use serde::Serialize;

/// Lifecycle of the worker loop.
///
/// `Idle -> Running`, `Running <-> Paused`, `Running | Paused -> Stopped`,
/// and `Stopped -> Running` unless the pipeline was shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl PipelineState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    /// Returns `true` while the worker loop is alive.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
