//! OpenTelemetry metrics for the herald delivery pipeline
//!
//! Metrics are pushed over OTLP/HTTP to an OpenTelemetry Collector, which can
//! expose them in Prometheus format for scraping.
//!
//! # Architecture
//!
//! ```text
//! herald → OTLP/HTTP → OpenTelemetry Collector → Prometheus (scrape) → Grafana
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use herald_metrics::{init_metrics, MetricsConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MetricsConfig {
//!     enabled: true,
//!     endpoint: "http://localhost:4318/v1/metrics".to_string(),
//! };
//!
//! init_metrics(&config)?;
//! # Ok(())
//! # }
//! ```

mod config;
mod delivery;
mod error;
mod exporter;

pub use config::MetricsConfig;
pub use delivery::DeliveryMetrics;
pub use error::MetricsError;
use once_cell::sync::OnceCell;

/// Global metrics instance
static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub delivery: DeliveryMetrics,
}

/// Initialize the metrics system
///
/// This must be called once at startup before any metrics are recorded.
/// If metrics are disabled in the config, this is a no-op.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or if called multiple times.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("Metrics collection is disabled");
        return Ok(());
    }

    tracing::info!(
        endpoint = %config.endpoint,
        "Initializing OpenTelemetry metrics with OTLP exporter"
    );

    let provider = exporter::init_otlp_exporter(&config.endpoint)?;
    opentelemetry::global::set_meter_provider(provider);

    let metrics = Metrics {
        delivery: DeliveryMetrics::new(),
    };

    METRICS_INSTANCE
        .set(metrics)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// Get the global metrics instance, if [`init_metrics`] enabled it.
#[must_use]
pub fn metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

/// Check if metrics are enabled
#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}
