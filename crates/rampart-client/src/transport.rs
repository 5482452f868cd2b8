//! reqwest-backed transport.

use async_trait::async_trait;
use rampart_config::TimeoutConfig;
use rampart_core::{Error, RequestDescriptor, Response, Result, Transport, TransportError};
use std::time::Duration;
use tracing::trace;

/// [`Transport`] that sends requests with a pooled `reqwest::Client`.
///
/// Redirects are not followed so that 3xx responses reach the cache and the
/// caller unchanged.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport honouring the connect and pool timeouts
    ///
    /// # Errors
    /// Returns a configuration error if the TLS backend cannot be initialised
    pub fn new(timeouts: &TimeoutConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .pool_idle_timeout(timeouts.pool)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::configuration(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// Wrap an existing client
    #[must_use]
    pub fn from_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn map_reqwest_error(error: &reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_connect() {
        let mapped = TransportError::connect(error.to_string());
        if error.is_timeout() {
            mapped.timed_out()
        } else {
            mapped
        }
    } else if error.is_timeout() {
        TransportError::read_timeout(timeout)
    } else if error.is_request() && !error.is_body() {
        TransportError::write(error.to_string())
    } else {
        TransportError::read(error.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: &RequestDescriptor,
        timeout: Duration,
    ) -> std::result::Result<Response, TransportError> {
        let mut builder = self
            .http
            .request(request.method().clone(), request.url().clone())
            .headers(request.headers().clone())
            .timeout(timeout);
        if let Some(body) = request.body() {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, timeout))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(&e, timeout))?;

        trace!(status = status.as_u16(), bytes = body.len(), "Transport response");
        Ok(Response::new(status, headers, body))
    }

    fn name(&self) -> &'static str {
        "reqwest"
    }
}
