//! Integration tests for the rampart HTTP pipeline
//!
//! This crate exercises complete clients end to end:
//! - Retry, breaker and limiter behaviour against scripted transports
//! - HTTP caching semantics with memory and disk backends
//! - The reqwest transport against a wiremock server
//! - Configuration loading, blocking calls and telemetry middleware

pub mod helpers;
pub mod transports;

// Re-export commonly used items
pub use helpers::*;
pub use transports::*;

#[cfg(test)]
mod breaker_tests;
#[cfg(test)]
mod cache_tests;
#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod http_tests;
#[cfg(test)]
mod rate_limit_tests;
