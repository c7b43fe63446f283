//! Observability for the celery bridge
//!
//! Structured logging, in-process publish and session metrics, and the
//! health endpoints served next to the task API.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{health_routes, health_status, HealthCheck, HealthStatus};
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{publish_span, session_span};
