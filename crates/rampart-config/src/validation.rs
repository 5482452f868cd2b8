//! Cross-field configuration checks.

use crate::config::ClientConfig;
use crate::error::{ConfigError, ConfigResult};
use rampart_core::{HeaderName, HeaderValue, Url};
use rampart_resilience::CacheBackendKind;
use validator::Validate;

impl ClientConfig {
    /// Run derive-level range checks and the checks that span components
    ///
    /// # Errors
    /// Returns [`ConfigError::Validation`] describing the first problem found
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.validate()?;

        if let Some(base_url) = &self.base_url {
            let url = Url::parse(base_url)
                .map_err(|e| ConfigError::validation(format!("base_url '{base_url}': {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::validation(format!(
                    "base_url '{base_url}' must use http or https"
                )));
            }
        }

        for (name, value) in &self.headers {
            HeaderName::try_from(name.as_str())
                .map_err(|e| ConfigError::validation(format!("header name '{name}': {e}")))?;
            HeaderValue::from_str(value)
                .map_err(|e| ConfigError::validation(format!("header '{name}' value: {e}")))?;
        }
        HeaderValue::from_str(&self.user_agent)
            .map_err(|e| ConfigError::validation(format!("user_agent: {e}")))?;

        if self.cache.enabled
            && self.cache.backend == CacheBackendKind::Disk
            && self.cache.disk_path.is_none()
        {
            return Err(ConfigError::validation(
                "cache backend 'disk' requires cache.disk_path",
            ));
        }

        if self.timeout.total.is_some_and(|total| total.is_zero()) {
            return Err(ConfigError::validation("timeout.total must be positive"));
        }

        Ok(())
    }
}
