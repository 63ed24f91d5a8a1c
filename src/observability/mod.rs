//! Observability for the BMS ingestor
//!
//! Structured logging, in-process metrics and the optional HTTP health
//! endpoints.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{ingest_span, lifecycle_span, mqtt_span};
