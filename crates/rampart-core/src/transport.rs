//! Outbound transport contract.

use crate::request::RequestDescriptor;
use crate::response::Response;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failure raised by a [`Transport`] before a response was obtained.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established
    #[error("connect error: {message}")]
    Connect {
        /// Description from the transport
        message: String,
        /// Whether the failure was a timeout
        timed_out: bool,
    },

    /// Reading the response failed
    #[error("read error: {message}")]
    Read {
        /// Description from the transport
        message: String,
        /// Whether the failure was a timeout
        timed_out: bool,
    },

    /// Writing the request failed
    #[error("write error: {message}")]
    Write {
        /// Description from the transport
        message: String,
        /// Whether the failure was a timeout
        timed_out: bool,
    },

    /// No pooled connection became available
    #[error("connection pool error: {message}")]
    Pool {
        /// Description from the transport
        message: String,
        /// Whether the failure was a timeout
        timed_out: bool,
    },
}

impl TransportError {
    /// Create a connect error
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            timed_out: false,
        }
    }

    /// Create a read error
    pub fn read(message: impl Into<String>) -> Self {
        Self::Read {
            message: message.into(),
            timed_out: false,
        }
    }

    /// Create a write error
    pub fn write(message: impl Into<String>) -> Self {
        Self::Write {
            message: message.into(),
            timed_out: false,
        }
    }

    /// Create a pool error
    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool {
            message: message.into(),
            timed_out: false,
        }
    }

    /// Create a read timeout
    pub fn read_timeout(after: Duration) -> Self {
        Self::Read {
            message: format!("no response within {}ms", after.as_millis()),
            timed_out: true,
        }
    }

    /// Mark this error as a timeout
    #[must_use]
    pub fn timed_out(mut self) -> Self {
        match &mut self {
            Self::Connect { timed_out, .. }
            | Self::Read { timed_out, .. }
            | Self::Write { timed_out, .. }
            | Self::Pool { timed_out, .. } => *timed_out = true,
        }
        self
    }

    /// Whether the failure was a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Connect { timed_out, .. }
            | Self::Read { timed_out, .. }
            | Self::Write { timed_out, .. }
            | Self::Pool { timed_out, .. } => *timed_out,
        }
    }

    /// Short phase label used in logs and metrics
    #[must_use]
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Pool { .. } => "pool",
        }
    }
}

/// Sends one request and returns the raw response.
///
/// Implementations must not retry, cache or rate limit on their own; the
/// pipeline owns those decisions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request`, giving up after `timeout`.
    async fn send(
        &self,
        request: &RequestDescriptor,
        timeout: Duration,
    ) -> Result<Response, TransportError>;

    /// Name for logs
    fn name(&self) -> &'static str {
        "transport"
    }
}
