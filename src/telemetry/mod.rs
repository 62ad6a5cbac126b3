//! Logging and metrics.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, level_enabled, shipping_span, LogOptions};
pub use metrics::{BridgeMetrics, FacadeSink, MetricsReporter, MetricsSink, MetricsSnapshot};
