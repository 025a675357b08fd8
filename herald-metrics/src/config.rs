//! Metrics configuration

use serde::Deserialize;

/// Configuration for metrics collection and export
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable or disable metrics collection
    ///
    /// When disabled, the pipeline skips every recording call.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// OTLP endpoint URL for metrics export
    ///
    /// Common values:
    /// - `http://localhost:4318/v1/metrics` (local collector)
    /// - `http://otel-collector:4318/v1/metrics` (Docker Compose service name)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

const fn default_enabled() -> bool {
    false
}

fn default_endpoint() -> String {
    "http://localhost:4318/v1/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            endpoint: default_endpoint(),
        }
    }
}
