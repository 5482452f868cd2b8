//! # Rampart Config
//!
//! Configuration for the rampart client.
//!
//! [`ClientConfig`] aggregates the timeout, retry, circuit breaker, rate
//! limiter and cache settings. It can be built in code, deserialized from
//! TOML, YAML or JSON, and overridden through `RAMPART_*` environment
//! variables by [`ConfigLoader`].
//!
//! ```no_run
//! # async fn example() -> Result<(), rampart_config::ConfigError> {
//! let config = rampart_config::ConfigLoader::new()
//!     .with_file("rampart.toml")
//!     .load()
//!     .await?;
//! assert!(config.retry.max_attempts >= 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod loader;
mod validation;

pub use config::{ClientConfig, TimeoutConfig};
pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigFormat, ConfigLoader, EnvLookup, DEFAULT_ENV_PREFIX};
