//! Layered configuration loading.
//!
//! Files are parsed into a generic value tree and deep-merged in the order
//! they were added, so later files override earlier ones key by key.
//! `RAMPART_*` environment variables are applied last.

use crate::config::ClientConfig;
use crate::error::{ConfigError, ConfigResult};
use rampart_resilience::CacheBackendKind;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default prefix of environment overrides.
pub const DEFAULT_ENV_PREFIX: &str = "RAMPART";

/// Source of environment variables
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.toml`
    Toml,
    /// `.yaml` / `.yml`
    Yaml,
    /// `.json`
    Json,
}

impl ConfigFormat {
    /// Format named by a file extension
    ///
    /// # Errors
    /// Returns [`ConfigError::UnsupportedFormat`] for any other extension
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "toml" => Ok(Self::Toml),
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Toml => "TOML",
            Self::Yaml => "YAML",
            Self::Json => "JSON",
        }
    }

    /// Parse `content` into a value tree
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] if `content` is malformed
    pub fn parse(self, content: &str) -> ConfigResult<Value> {
        let parsed = match self {
            Self::Toml => toml::from_str::<Value>(content).map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::from_str::<Value>(content).map_err(|e| e.to_string()),
            Self::Json => serde_json::from_str::<Value>(content).map_err(|e| e.to_string()),
        };
        parsed.map_err(|message| ConfigError::Parse {
            format: self.name(),
            message,
        })
    }
}

/// Loads a [`ClientConfig`] from files and the environment.
#[derive(Clone)]
pub struct ConfigLoader {
    files: Vec<PathBuf>,
    env_prefix: String,
    env: Option<EnvLookup>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("files", &self.files)
            .field("env_prefix", &self.env_prefix)
            .field("env", &self.env.is_some())
            .finish()
    }
}

impl ConfigLoader {
    /// Loader reading the process environment
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            env: Some(Arc::new(|key| std::env::var(key).ok())),
        }
    }

    /// Add a file; later files override earlier ones
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    /// Read overrides through `lookup` instead of the process environment
    #[must_use]
    pub fn with_env_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Some(Arc::new(lookup));
        self
    }

    /// Change the variable prefix
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Ignore the environment
    #[must_use]
    pub fn without_env(mut self) -> Self {
        self.env = None;
        self
    }

    /// Load, merge, override and validate
    ///
    /// # Errors
    /// Returns an error if a file cannot be read or parsed, an override is
    /// malformed, or the result fails validation
    pub async fn load(&self) -> ConfigResult<ClientConfig> {
        let mut merged = Value::Object(serde_json::Map::new());
        for path in &self.files {
            let format = ConfigFormat::from_path(path)?;
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
            merge(&mut merged, format.parse(&content)?);
            debug!(path = %path.display(), "Loaded config file");
        }
        let mut config = from_value(merged)?;
        if let Some(env) = &self.env {
            apply_env(&mut config, &self.env_prefix, env.as_ref())?;
        }
        config.validate_all()?;
        Ok(config)
    }

    /// Parse a single document without touching files or the environment
    ///
    /// # Errors
    /// Returns an error if `content` is malformed or fails validation
    pub fn parse_str(content: &str, format: ConfigFormat) -> ConfigResult<ClientConfig> {
        let config = from_value(format.parse(content)?)?;
        config.validate_all()?;
        Ok(config)
    }
}

fn from_value(value: Value) -> ConfigResult<ClientConfig> {
    serde_json::from_value(value).map_err(|e| ConfigError::Parse {
        format: "merged",
        message: e.to_string(),
    })
}

/// Deep-merge `overlay` into `base`; objects merge key by key, anything else
/// is replaced.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[derive(Deserialize)]
struct HumanDuration(#[serde(with = "humantime_serde")] Duration);

struct EnvReader<'a> {
    prefix: &'a str,
    lookup: &'a (dyn Fn(&str) -> Option<String> + Send + Sync),
}

impl EnvReader<'_> {
    fn raw(&self, suffix: &str) -> Option<(String, String)> {
        let key = format!("{}_{suffix}", self.prefix);
        (self.lookup)(&key).map(|value| (key, value))
    }

    fn parse<T>(&self, suffix: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.raw(suffix)
            .map(|(key, value)| {
                value.trim().parse::<T>().map_err(|e| ConfigError::Env {
                    message: e.to_string(),
                    key,
                    value,
                })
            })
            .transpose()
    }

    fn duration(&self, suffix: &str) -> ConfigResult<Option<Duration>> {
        self.raw(suffix)
            .map(|(key, value)| {
                serde_json::from_value::<HumanDuration>(Value::String(value.trim().to_string()))
                    .map(|d| d.0)
                    .map_err(|e| ConfigError::Env {
                        message: e.to_string(),
                        key,
                        value,
                    })
            })
            .transpose()
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn apply_env(
    config: &mut ClientConfig,
    prefix: &str,
    lookup: &(dyn Fn(&str) -> Option<String> + Send + Sync),
) -> ConfigResult<()> {
    let env = EnvReader { prefix, lookup };

    if let Some(base_url) = env.parse::<String>("BASE_URL")? {
        config.base_url = Some(base_url);
    }
    set(&mut config.user_agent, env.parse("USER_AGENT")?);
    set(
        &mut config.generate_idempotency_keys,
        env.parse("GENERATE_IDEMPOTENCY_KEYS")?,
    );

    set(&mut config.timeout.connect, env.duration("TIMEOUT_CONNECT")?);
    set(&mut config.timeout.read, env.duration("TIMEOUT_READ")?);
    set(&mut config.timeout.write, env.duration("TIMEOUT_WRITE")?);
    set(&mut config.timeout.pool, env.duration("TIMEOUT_POOL")?);
    if let Some(total) = env.duration("TIMEOUT_TOTAL")? {
        config.timeout.total = Some(total);
    }

    set(&mut config.retry.max_attempts, env.parse("RETRY_MAX_ATTEMPTS")?);
    set(
        &mut config.retry.backoff_factor,
        env.duration("RETRY_BACKOFF_FACTOR")?,
    );
    set(&mut config.retry.backoff_max, env.duration("RETRY_BACKOFF_MAX")?);

    set(&mut config.circuit_breaker.enabled, env.parse("CB_ENABLED")?);
    set(
        &mut config.circuit_breaker.failure_threshold,
        env.parse("CB_FAILURE_THRESHOLD")?,
    );
    set(
        &mut config.circuit_breaker.success_threshold,
        env.parse("CB_SUCCESS_THRESHOLD")?,
    );
    set(
        &mut config.circuit_breaker.reset_timeout,
        env.duration("CB_RESET_TIMEOUT")?,
    );
    set(&mut config.circuit_breaker.per_host, env.parse("CB_PER_HOST")?);

    set(&mut config.rate_limit.enabled, env.parse("RATELIMIT_ENABLED")?);
    set(
        &mut config.rate_limit.max_requests,
        env.parse("RATELIMIT_MAX_REQUESTS")?,
    );
    set(
        &mut config.rate_limit.time_window,
        env.duration("RATELIMIT_TIME_WINDOW")?,
    );
    set(
        &mut config.rate_limit.burst_size,
        env.parse("RATELIMIT_BURST_SIZE")?,
    );

    set(&mut config.cache.enabled, env.parse("CACHE_ENABLED")?);
    set(&mut config.cache.default_ttl, env.duration("CACHE_DEFAULT_TTL")?);
    if let Some(dir) = env.parse::<PathBuf>("CACHE_DIR")? {
        config.cache.backend = CacheBackendKind::Disk;
        config.cache.disk_path = Some(dir);
    }

    Ok(())
}
