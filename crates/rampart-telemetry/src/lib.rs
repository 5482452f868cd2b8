//! # Rampart Telemetry
//!
//! Observability for the rampart HTTP pipeline:
//! - Subscriber setup with an env filter and human or JSON output
//! - A per-call logging middleware with request id correlation
//! - A per-attempt Prometheus metrics middleware

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;
pub mod tracing_setup;

pub use logging::{LoggingMiddleware, REQUEST_ID_HEADER};
pub use metrics::{Metrics, MetricsError, MetricsMiddleware};
pub use tracing_setup::{init_tracing, LogFormat, TracingConfig, TracingError};
