//! Error types for ecman Core
//!
//! Three layers:
//! - `ProviderError` for anything the provider gateway reports
//! - `MigrationError` for per-instance task failures (caught at the task boundary)
//! - `SelectionError` for the eligibility query, the only error that aborts a run

use crate::types::InstanceState;
use std::time::Duration;

/// Failure reported by the provider gateway
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// API rejected the request
    #[error("{code}: {message}")]
    Api { code: String, message: String },

    /// Resource does not exist
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Request was throttled
    #[error("request throttled: {0}")]
    Throttled(String),

    /// Network or transport failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Create API error
    #[inline]
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Check if a retry might succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Transport(_))
    }
}

/// Per-instance migration failure
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Provider call failed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Target lifecycle state not reached in time
    #[error("timed out after {}s waiting for {instance_id} to become {target}", .waited.as_secs())]
    WaitTimeout {
        instance_id: String,
        target: InstanceState,
        waited: Duration,
    },

    /// Instance entered a state from which the target is unreachable
    #[error("instance {instance_id} entered {observed} while waiting for {target}")]
    UnexpectedState {
        instance_id: String,
        target: InstanceState,
        observed: InstanceState,
    },

    /// Run was cancelled or its deadline expired
    #[error("operation cancelled")]
    Cancelled,

    /// Failure inside a named step
    #[error("{context}: {source}")]
    Stage {
        context: &'static str,
        #[source]
        source: Box<MigrationError>,
    },
}

impl MigrationError {
    /// Wrap with step context (`"create snapshot: <err>"`)
    #[inline]
    #[must_use]
    pub fn context(self, context: &'static str) -> Self {
        Self::Stage {
            context,
            source: Box::new(self),
        }
    }

    /// Innermost error beneath any step context
    #[must_use]
    pub fn root(&self) -> &MigrationError {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if a retry might succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Provider(e) => e.is_retryable(),
            Self::WaitTimeout { .. } => true,
            _ => false,
        }
    }

    /// Check if the failure was caused by cancellation
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }
}

/// Eligibility query failed; aborts the run before any task starts
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    /// Tag query failed
    #[error("fetch instances: {0}")]
    Query(#[from] ProviderError),

    /// Override instance does not exist
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Cancelled before selection completed
    #[error("selection cancelled")]
    Cancelled,
}

/// Invalid configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No target image configured
    #[error("target image is required")]
    MissingTargetImage,

    /// Concurrency must allow at least one task
    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,

    /// Poll interval must be positive
    #[error("poll_interval must be greater than zero")]
    ZeroPollInterval,

    /// Enabled marker value is empty
    #[error("enabled value must not be empty")]
    EmptyEnabledValue,

    /// TOML parse failure
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file could not be read
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_context_prefixes_message() {
        let err = MigrationError::from(ProviderError::api("UnauthorizedOperation", "denied"))
            .context("create snapshot");
        assert_eq!(
            err.to_string(),
            "create snapshot: UnauthorizedOperation: denied"
        );
    }

    #[test]
    fn retryable_looks_through_context() {
        let throttled =
            MigrationError::from(ProviderError::Throttled("slow down".into())).context("run instances");
        assert!(throttled.is_retryable());

        let timeout = MigrationError::WaitTimeout {
            instance_id: "i-1".into(),
            target: InstanceState::Stopped,
            waited: Duration::from_secs(300),
        }
        .context("stop instance");
        assert!(timeout.is_retryable());
        assert_eq!(
            timeout.to_string(),
            "stop instance: timed out after 300s waiting for i-1 to become stopped"
        );

        let denied = MigrationError::from(ProviderError::api("AuthFailure", "no"));
        assert!(!denied.is_retryable());
    }

    #[test]
    fn cancelled_detected_through_context() {
        let err = MigrationError::Cancelled.context("terminate instance");
        assert!(err.is_cancelled());
        assert!(!MigrationError::from(ProviderError::NotFound("i-1".into())).is_cancelled());
    }

    #[test]
    fn selection_error_display() {
        let err = SelectionError::from(ProviderError::Transport("connection reset".into()));
        assert_eq!(err.to_string(), "fetch instances: transport error: connection reset");
    }
}
