//! Migration configuration
//!
//! Everything a run needs is passed in explicitly through `MigrationConfig`.
//! Loadable from TOML; durations are written as whole seconds:
//!
//! ```toml
//! target_image = "ami-0new"
//! enabled_value = "enabled"
//! timeout = 3600
//! wait_timeout = 300
//! poll_interval = 10
//! max_concurrency = 16
//! ```

use crate::error::ConfigError;
use crate::tags;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default bound on a single lifecycle wait
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default lifecycle poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of instances migrated at once
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Migration run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Image id replacements are launched from
    pub target_image: String,
    /// Value `migrate-enabled` must carry for an instance to be selected
    pub enabled_value: String,
    /// Migrate only this instance, bypassing tag selection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_override: Option<String>,
    /// Deadline for the whole run, covering tasks still queued for a permit;
    /// unset means each task is bounded only by its own waits
    #[serde(skip_serializing_if = "Option::is_none", with = "opt_secs")]
    pub timeout: Option<Duration>,
    /// Bound on each start/stop wait
    #[serde(with = "secs")]
    pub wait_timeout: Duration,
    /// Interval between lifecycle polls
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Maximum tasks in flight
    pub max_concurrency: usize,
}

impl MigrationConfig {
    /// Create configuration targeting `target_image`
    #[inline]
    #[must_use]
    pub fn new(target_image: impl Into<String>) -> Self {
        Self {
            target_image: target_image.into(),
            ..Self::default()
        }
    }

    /// With enabled marker value
    #[inline]
    #[must_use]
    pub fn with_enabled_value(mut self, value: impl Into<String>) -> Self {
        self.enabled_value = value.into();
        self
    }

    /// With single-instance override
    #[inline]
    #[must_use]
    pub fn with_instance_override(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_override = Some(instance_id.into());
        self
    }

    /// With whole-run deadline
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// With lifecycle wait bound
    #[inline]
    #[must_use]
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// With lifecycle poll interval
    #[inline]
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// With max concurrent tasks
    #[inline]
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Check the configuration can drive a run
    ///
    /// # Errors
    /// - `ConfigError::MissingTargetImage` if no target image is set
    /// - `ConfigError::EmptyEnabledValue` if the marker value is empty
    /// - `ConfigError::ZeroConcurrency` / `ConfigError::ZeroPollInterval` on zero limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_image.trim().is_empty() {
            return Err(ConfigError::MissingTargetImage);
        }
        if self.enabled_value.is_empty() {
            return Err(ConfigError::EmptyEnabledValue);
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }

    /// Parse from TOML text (not validated; flags may still fill gaps)
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed TOML or wrong field types
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// `ConfigError::Io` if unreadable, `ConfigError::Parse` if malformed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            target_image: String::new(),
            enabled_value: tags::ENABLED.to_string(),
            instance_override: None,
            timeout: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|secs| secs.map(Duration::from_secs))
    }
}
