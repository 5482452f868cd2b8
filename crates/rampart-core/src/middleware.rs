//! Middleware contract and continuation.
//!
//! A [`MiddlewareChain`] is an immutable ordered list of [`Middleware`]
//! composed around a terminal [`Endpoint`]. Each unit receives the request
//! and a [`Next`] continuation. It may rewrite the request, return early
//! without calling `next`, or await `next` and post-process the outcome.
//! Response-side processing therefore runs in reverse declaration order
//! through ordinary call nesting.

use crate::outcome::Outcome;
use crate::request::RequestDescriptor;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// A unit of request/response processing.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process `request`, usually by awaiting `next.run(request)`.
    async fn handle(&self, request: RequestDescriptor, next: Next<'_>) -> Outcome;

    /// Name for logs
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Innermost handler of a chain.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Produce the outcome for `request`
    async fn call(&self, request: RequestDescriptor) -> Outcome;
}

#[async_trait]
impl<F> Endpoint for F
where
    F: Fn(RequestDescriptor) -> BoxFuture<'static, Outcome> + Send + Sync,
{
    async fn call(&self, request: RequestDescriptor) -> Outcome {
        (self)(request).await
    }
}

/// The remainder of a chain.
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    /// Continuation over `middleware` ending at `endpoint`
    #[must_use]
    pub fn new(middleware: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Endpoint) -> Self {
        Self {
            middleware,
            endpoint,
        }
    }

    /// Run the rest of the chain
    pub async fn run(mut self, request: RequestDescriptor) -> Outcome {
        if let Some((current, rest)) = self.middleware.split_first() {
            self.middleware = rest;
            current.handle(request, self).await
        } else {
            self.endpoint.call(request).await
        }
    }
}

/// Ordered, immutable list of middleware.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Arc<[Arc<dyn Middleware>]>,
}

impl MiddlewareChain {
    /// Chain running `layers` in order
    #[must_use]
    pub fn new(layers: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            layers: layers.into(),
        }
    }

    /// Number of units
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the chain has no units
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run `request` through every unit and then `endpoint`
    pub async fn run(&self, request: RequestDescriptor, endpoint: &dyn Endpoint) -> Outcome {
        Next::new(&self.layers, endpoint).run(request).await
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.layers.iter().map(|m| m.name()))
            .finish()
    }
}
