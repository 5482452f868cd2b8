//! Per-call request logging.

use async_trait::async_trait;
use rampart_core::{
    HeaderName, HeaderValue, Middleware, Next, Outcome, RequestDescriptor, SharedClock,
    SystemClock,
};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Header carrying the call correlation id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Logs every logical call exactly once, inside a span tagged with its
/// request id.
///
/// Register it at the per-call insertion point. A request id already set by
/// the caller is kept; otherwise a UUID v4 is generated.
pub struct LoggingMiddleware {
    clock: SharedClock,
    header: HeaderName,
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingMiddleware {
    /// Middleware timing calls with the system clock
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: SystemClock::shared(),
            header: HeaderName::from_static(REQUEST_ID_HEADER),
        }
    }

    /// Measure latency with `clock`
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Use `header` instead of `x-request-id`
    #[must_use]
    pub fn with_header(mut self, header: HeaderName) -> Self {
        self.header = header;
        self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, mut request: RequestDescriptor, next: Next<'_>) -> Outcome {
        let request_id = match request
            .headers()
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => existing.to_string(),
            None => {
                let generated = Uuid::new_v4().to_string();
                if let Ok(value) = HeaderValue::from_str(&generated) {
                    request.headers_mut().insert(self.header.clone(), value);
                }
                generated
            }
        };

        let span = info_span!(
            "http_call",
            request_id = %request_id,
            method = %request.method(),
            url = %request.url(),
        );
        let started = self.clock.now();
        let outcome = next.run(request).instrument(span.clone()).await;
        let latency_ms = self.clock.now().saturating_duration_since(started).as_millis() as u64;

        span.in_scope(|| log_outcome(&outcome, latency_ms));
        outcome
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

fn log_outcome(outcome: &Outcome, latency_ms: u64) {
    match outcome {
        Outcome::Success(response) => info!(
            status = response.status().as_u16(),
            source = ?response.source(),
            latency_ms = latency_ms,
            "Call succeeded"
        ),
        Outcome::RetryableFailure(failure) | Outcome::FatalFailure(failure) => warn!(
            outcome = outcome.label(),
            status = failure.status(),
            attempts = failure.attempts,
            cause = %failure.cause,
            latency_ms = latency_ms,
            "Call failed"
        ),
        Outcome::CircuitRejected(rejection) => warn!(
            circuit = %rejection.target,
            reason = %rejection.reason,
            latency_ms = latency_ms,
            "Call rejected by circuit breaker"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use rampart_core::{HeaderMap, ManualClock, Method, MiddlewareChain, Response, StatusCode};
    use std::sync::Arc;

    fn echo_request_id(request: RequestDescriptor) -> BoxFuture<'static, Outcome> {
        let mut headers = HeaderMap::new();
        if let Some(id) = request.headers().get(REQUEST_ID_HEADER) {
            headers.insert(REQUEST_ID_HEADER, id.clone());
        }
        Box::pin(async move { Outcome::Success(Response::new(StatusCode::OK, headers, "")) })
    }

    #[tokio::test]
    async fn test_generates_request_id() {
        let chain = MiddlewareChain::new(vec![Arc::new(
            LoggingMiddleware::new().with_clock(Arc::new(ManualClock::new())),
        )]);
        let request = RequestDescriptor::new(Method::GET, "https://api.example.com/a").unwrap();

        let outcome = chain.run(request, &echo_request_id).await;

        let id = outcome
            .response()
            .and_then(|r| r.header_str(REQUEST_ID_HEADER))
            .unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_keeps_caller_request_id() {
        let chain = MiddlewareChain::new(vec![Arc::new(LoggingMiddleware::new())]);
        let request = RequestDescriptor::builder(Method::GET, "https://api.example.com/a")
            .header(REQUEST_ID_HEADER, "caller-42")
            .build()
            .unwrap();

        let outcome = chain.run(request, &echo_request_id).await;

        assert_eq!(
            outcome.response().and_then(|r| r.header_str(REQUEST_ID_HEADER)),
            Some("caller-42")
        );
    }
}
