//! Status recorder
//!
//! Writes the audit triple (`migrate-status`, `migrate-message`,
//! `migrate-timestamp`) in a single tag call. Each write replaces the
//! previous triple; no history is kept.

use crate::error::MigrationError;
use crate::provider::{guarded, ProviderGateway};
use crate::tags;
use crate::types::{AuditStatus, TagSet};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Writes audit tags to instances
#[derive(Clone)]
pub struct StatusRecorder {
    gateway: Arc<dyn ProviderGateway>,
}

impl StatusRecorder {
    /// Create new recorder
    #[inline]
    #[must_use]
    pub fn new(gateway: Arc<dyn ProviderGateway>) -> Self {
        Self { gateway }
    }

    /// Build the triple for `status` at the current time
    #[must_use]
    pub fn audit_tags(status: AuditStatus, message: &str) -> TagSet {
        let [status_key, message_key, timestamp_key] = tags::AUDIT_KEYS;
        TagSet::new()
            .with(status_key, status.as_str())
            .with(message_key, message)
            .with(timestamp_key, timestamp())
    }

    /// Write the audit triple to `instance_id`
    ///
    /// # Errors
    /// `MigrationError::Provider` if the tag call fails, `Cancelled` if the run was cancelled
    pub async fn record_status(
        &self,
        cancel: &CancellationToken,
        instance_id: &str,
        status: AuditStatus,
        message: &str,
    ) -> Result<(), MigrationError> {
        let tags = Self::audit_tags(status, message);
        let resources = [instance_id.to_string()];
        guarded(cancel, self.gateway.create_tags(&resources, &tags)).await
    }

    /// Write the audit triple, logging instead of returning failures
    pub async fn record_best_effort(
        &self,
        cancel: &CancellationToken,
        instance_id: &str,
        status: AuditStatus,
        message: &str,
    ) {
        match self.record_status(cancel, instance_id, status, message).await {
            Ok(()) => tracing::debug!(instance_id, %status, "recorded audit status"),
            Err(e) => tracing::warn!(
                instance_id,
                %status,
                error = %e,
                "failed to record audit status"
            ),
        }
    }
}

impl std::fmt::Debug for StatusRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusRecorder").finish_non_exhaustive()
    }
}

/// Machine-sortable UTC timestamp (`2024-05-01T12:00:00Z`)
fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::memory::{InMemoryGateway, Operation};
    use crate::types::{Instance, InstanceState};

    fn setup() -> (Arc<InMemoryGateway>, StatusRecorder) {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.insert_instance(Instance::new("i-1", InstanceState::Stopped, "t3.micro"));
        let recorder = StatusRecorder::new(gateway.clone());
        (gateway, recorder)
    }

    #[tokio::test]
    async fn writes_triple_in_one_call() {
        let (gateway, recorder) = setup();
        let cancel = CancellationToken::new();

        recorder
            .record_status(&cancel, "i-1", AuditStatus::InProgress, "Starting migration")
            .await
            .unwrap();

        let calls = gateway.calls_of(Operation::CreateTags);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].resources, vec!["i-1".to_string()]);
        assert_eq!(calls[0].tags.len(), 3);

        let instance = gateway.instance("i-1").unwrap();
        assert_eq!(instance.audit_status(), Some(AuditStatus::InProgress));
        assert_eq!(
            instance.tags.get(tags::MIGRATE_MESSAGE),
            Some("Starting migration")
        );
    }

    #[tokio::test]
    async fn later_write_overwrites_triple() {
        let (gateway, recorder) = setup();
        let cancel = CancellationToken::new();

        recorder
            .record_status(&cancel, "i-1", AuditStatus::InProgress, "Starting migration")
            .await
            .unwrap();
        recorder
            .record_status(&cancel, "i-1", AuditStatus::Failed, "Failed to upgrade instance: boom")
            .await
            .unwrap();

        let instance = gateway.instance("i-1").unwrap();
        assert_eq!(instance.audit_status(), Some(AuditStatus::Failed));
        assert_eq!(
            instance.tags.get(tags::MIGRATE_MESSAGE),
            Some("Failed to upgrade instance: boom")
        );
        assert_eq!(instance.tags.len(), 3);
    }

    #[tokio::test]
    async fn timestamp_is_rfc3339_utc_seconds() {
        let (gateway, recorder) = setup();
        recorder
            .record_status(&CancellationToken::new(), "i-1", AuditStatus::Skipped, "criteria not met")
            .await
            .unwrap();

        let instance = gateway.instance("i-1").unwrap();
        let stamp = instance.tags.get(tags::MIGRATE_TIMESTAMP).unwrap();
        assert!(stamp.ends_with('Z'));
        assert_eq!(stamp.len(), "2024-05-01T12:00:00Z".len());
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[tokio::test]
    async fn best_effort_swallows_failures() {
        let (gateway, recorder) = setup();
        gateway.fail(
            Operation::CreateTags,
            ProviderError::Throttled("rate exceeded".into()),
        );

        recorder
            .record_best_effort(&CancellationToken::new(), "i-1", AuditStatus::Completed, "done")
            .await;

        assert_eq!(gateway.calls_of(Operation::CreateTags).len(), 1);
        assert!(gateway.instance("i-1").unwrap().audit_status().is_none());
    }
}
