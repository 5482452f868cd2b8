//! Request authentication capability.

use crate::error::{Error, Result};
use crate::request::RequestDescriptor;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::future::BoxFuture;
use http::header::{HeaderValue, AUTHORIZATION};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, Secret};
use std::fmt;
use std::sync::Arc;

/// Decorates requests with credentials.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Return `request` with credentials applied
    async fn apply(&self, request: RequestDescriptor) -> Result<RequestDescriptor>;

    /// Refresh credentials after a 401. Returns `true` if the request
    /// should be sent again.
    async fn refresh(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Source of fresh bearer tokens
pub type TokenRefresher = Arc<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// `Authorization: Bearer <token>`
pub struct BearerAuth {
    token: RwLock<Secret<String>>,
    refresher: Option<TokenRefresher>,
}

impl BearerAuth {
    /// Static bearer token
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Secret::new(token.into())),
            refresher: None,
        }
    }

    /// Token that is replaced by `refresher` after a 401
    #[must_use]
    pub fn with_refresher(mut self, refresher: TokenRefresher) -> Self {
        self.refresher = Some(refresher);
        self
    }
}

impl fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerAuth")
            .field("token", &"[REDACTED]")
            .field("refreshable", &self.refresher.is_some())
            .finish()
    }
}

#[async_trait]
impl AuthProvider for BearerAuth {
    async fn apply(&self, request: RequestDescriptor) -> Result<RequestDescriptor> {
        let value = {
            let token = self.token.read();
            HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| Error::configuration(format!("invalid bearer token: {e}")))?
        };
        Ok(request.with_header(AUTHORIZATION, sensitive(value)))
    }

    async fn refresh(&self) -> Result<bool> {
        let Some(refresher) = &self.refresher else {
            return Ok(false);
        };
        let token = refresher().await?;
        *self.token.write() = Secret::new(token);
        Ok(true)
    }
}

/// `Authorization: Basic <base64(user:password)>`
pub struct BasicAuth {
    username: String,
    password: Secret<String>,
}

impl BasicAuth {
    /// Credentials for HTTP basic auth
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl AuthProvider for BasicAuth {
    async fn apply(&self, request: RequestDescriptor) -> Result<RequestDescriptor> {
        let encoded = STANDARD.encode(format!(
            "{}:{}",
            self.username,
            self.password.expose_secret()
        ));
        let value = HeaderValue::from_str(&format!("Basic {encoded}"))
            .map_err(|e| Error::configuration(format!("invalid basic credentials: {e}")))?;
        Ok(request.with_header(AUTHORIZATION, sensitive(value)))
    }
}

fn sensitive(mut value: HeaderValue) -> HeaderValue {
    value.set_sensitive(true);
    value
}
