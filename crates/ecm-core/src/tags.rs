//! Reserved tag keys
//!
//! Tags double as the control channel (eligibility markers) and the audit
//! channel (status triple) between operators and the orchestrator.

/// Primary eligibility marker; its value is matched against the configured enabled value
pub const MIGRATE_ENABLED: &str = "migrate-enabled";

/// Secondary marker, required only for instances that are currently running
pub const MIGRATE_IF_RUNNING: &str = "migrate-if-running";

/// Audit status key; never copied to a replacement
pub const MIGRATE_STATUS: &str = "migrate-status";

/// Audit message key
pub const MIGRATE_MESSAGE: &str = "migrate-message";

/// Audit timestamp key
pub const MIGRATE_TIMESTAMP: &str = "migrate-timestamp";

/// Marker value that opts an instance in
pub const ENABLED: &str = "enabled";

/// Keys written as one audit triple
pub const AUDIT_KEYS: [&str; 3] = [MIGRATE_STATUS, MIGRATE_MESSAGE, MIGRATE_TIMESTAMP];
