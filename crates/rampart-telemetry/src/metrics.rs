//! Prometheus metrics for transport attempts.
//!
//! Each [`Metrics`] owns its own registry so several clients in one process
//! do not collide. Mount [`MetricsMiddleware`] at the per-attempt insertion
//! point to count every retry individually.

use async_trait::async_trait;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use rampart_core::{Middleware, Next, Outcome, RequestDescriptor, SharedClock, SystemClock};
use std::sync::Arc;

/// Attempt latency buckets in seconds
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Metrics error
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Metric creation or registration failed
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    /// Exposition output was not UTF-8
    #[error("metrics encoding error: {0}")]
    Encoding(String),
}

/// Attempt counters and latency histograms.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    attempts: IntCounterVec,
    duration: HistogramVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Metrics registered in a fresh registry
    ///
    /// # Errors
    /// Returns an error if a metric cannot be created or registered
    pub fn new() -> Result<Self, MetricsError> {
        Self::with_registry(Registry::new())
    }

    /// Metrics registered in `registry`
    ///
    /// # Errors
    /// Returns an error if a metric cannot be created, or if `registry`
    /// already holds metrics with the same names
    pub fn with_registry(registry: Registry) -> Result<Self, MetricsError> {
        let attempts = IntCounterVec::new(
            Opts::new(
                "rampart_attempts_total",
                "Transport attempts by method, host and outcome",
            ),
            &["method", "host", "outcome"],
        )?;
        registry.register(Box::new(attempts.clone()))?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "rampart_attempt_duration_seconds",
                "Transport attempt latency",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["method", "host"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            attempts,
            duration,
        })
    }

    /// Registry holding these metrics
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one attempt
    pub fn record_attempt(&self, method: &str, host: &str, outcome: &str, seconds: f64) {
        self.attempts
            .with_label_values(&[method, host, outcome])
            .inc();
        self.duration
            .with_label_values(&[method, host])
            .observe(seconds);
    }

    /// Attempts recorded for one label combination
    #[must_use]
    pub fn attempts(&self, method: &str, host: &str, outcome: &str) -> u64 {
        self.attempts
            .with_label_values(&[method, host, outcome])
            .get()
    }

    /// Render the registry in the text exposition format
    ///
    /// # Errors
    /// Returns an error if encoding fails
    pub fn gather_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    /// Per-attempt middleware recording into these metrics
    #[must_use]
    pub fn middleware(self: &Arc<Self>) -> MetricsMiddleware {
        MetricsMiddleware::new(Arc::clone(self))
    }
}

/// Records every attempt passing through it.
pub struct MetricsMiddleware {
    metrics: Arc<Metrics>,
    clock: SharedClock,
}

impl MetricsMiddleware {
    /// Middleware timing attempts with the system clock
    #[must_use]
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            clock: SystemClock::shared(),
        }
    }

    /// Measure latency with `clock`
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle(&self, request: RequestDescriptor, next: Next<'_>) -> Outcome {
        let method = request.method().to_string();
        let host = request.host();
        let started = self.clock.now();

        let outcome = next.run(request).await;

        let elapsed = self.clock.now().saturating_duration_since(started);
        self.metrics
            .record_attempt(&method, &host, outcome.label(), elapsed.as_secs_f64());
        outcome
    }

    fn name(&self) -> &'static str {
        "metrics"
    }
}
