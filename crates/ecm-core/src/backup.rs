//! Backup stage
//!
//! Snapshots every EBS volume attached to an instance before it is replaced.
//! Snapshots already taken when a later volume fails are left in place as a
//! standing backup.

use crate::error::MigrationError;
use crate::provider::{guarded, ProviderGateway};
use crate::types::Instance;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Pre-migration volume snapshots
#[derive(Clone)]
pub struct BackupStage {
    gateway: Arc<dyn ProviderGateway>,
}

impl BackupStage {
    /// Create new backup stage
    #[inline]
    #[must_use]
    pub fn new(gateway: Arc<dyn ProviderGateway>) -> Self {
        Self { gateway }
    }

    /// Snapshot description recorded for `instance_id`
    #[must_use]
    pub fn description(instance_id: &str) -> String {
        format!("Backup before AMI migration for instance {instance_id}")
    }

    /// Snapshot each snapshot-capable volume of `instance`, in attachment order
    ///
    /// # Returns
    /// Snapshot ids, one per EBS volume
    ///
    /// # Errors
    /// The first failing `create_snapshot`, wrapped as `"create snapshot: <err>"`
    pub async fn snapshot_volumes(
        &self,
        cancel: &CancellationToken,
        instance: &Instance,
    ) -> Result<Vec<String>, MigrationError> {
        let description = Self::description(&instance.id);
        let mut snapshots = Vec::new();

        for volume_id in instance.volumes.iter().filter_map(|v| v.snapshot_volume()) {
            let snapshot_id = guarded(cancel, self.gateway.create_snapshot(volume_id, &description))
                .await
                .map_err(|e| e.context("create snapshot"))?;
            tracing::info!(instance_id = %instance.id, volume_id, snapshot_id = %snapshot_id, "volume snapshot created");
            snapshots.push(snapshot_id);
        }

        Ok(snapshots)
    }
}

impl std::fmt::Debug for BackupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupStage").finish_non_exhaustive()
    }
}
