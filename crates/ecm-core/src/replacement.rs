//! Replacement stage
//!
//! Per-task state machine that swaps a source instance for one launched from
//! the target image:
//!
//! ```text
//! selected -> snapshotting -> stopping (running sources only) -> launching
//!          -> terminating-old -> tag-copy -> done
//!                  \______________ any failure ______________/ -> failed
//! ```
//!
//! Steps never overlap. A failure after `launching` leaves the replacement
//! running alongside the source; it is reported, not rolled back.

use crate::backup::BackupStage;
use crate::error::MigrationError;
use crate::lifecycle::LifecycleController;
use crate::provider::{guarded, ProviderGateway};
use crate::tags;
use crate::types::{Instance, MigrationTask};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Phase of a replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplacementPhase {
    Selected,
    Snapshotting,
    Stopping,
    Launching,
    TerminatingOld,
    TagCopy,
}

impl ReplacementPhase {
    /// Wire name of the phase
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplacementPhase::Selected => "selected",
            ReplacementPhase::Snapshotting => "snapshotting",
            ReplacementPhase::Stopping => "stopping",
            ReplacementPhase::Launching => "launching",
            ReplacementPhase::TerminatingOld => "terminating-old",
            ReplacementPhase::TagCopy => "tag-copy",
        }
    }
}

impl std::fmt::Display for ReplacementPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replacement failed during `phase`
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct ReplacementError {
    /// Phase that failed
    pub phase: ReplacementPhase,
    /// Replacement launched before the failure, if any
    pub replacement_id: Option<String>,
    /// Underlying failure, with step context
    #[source]
    pub source: MigrationError,
}

/// Successful replacement
#[derive(Debug, Clone)]
pub struct Replacement {
    /// Newly launched instance (as returned by the launch call, plus copied tags)
    pub instance: Instance,
    /// Pre-migration snapshot ids
    pub snapshots: Vec<String>,
}

/// Swaps instances onto the target image
#[derive(Clone)]
pub struct ReplacementStage {
    gateway: Arc<dyn ProviderGateway>,
    backup: BackupStage,
    lifecycle: LifecycleController,
}

impl ReplacementStage {
    /// Create new replacement stage
    #[inline]
    #[must_use]
    pub fn new(gateway: Arc<dyn ProviderGateway>, lifecycle: LifecycleController) -> Self {
        Self {
            backup: BackupStage::new(gateway.clone()),
            gateway,
            lifecycle,
        }
    }

    /// Run the replacement for `task`
    ///
    /// # Errors
    /// `ReplacementError` naming the failed phase; `replacement_id` is set when
    /// the failure happened after the replacement was launched
    pub async fn replace(
        &self,
        cancel: &CancellationToken,
        task: &MigrationTask,
    ) -> Result<Replacement, ReplacementError> {
        let source = &task.instance;
        let mut phase = ReplacementPhase::Selected;
        let mut replacement_id: Option<String> = None;

        let outcome: Result<Replacement, MigrationError> = async {
            phase = ReplacementPhase::Snapshotting;
            let snapshots = self.backup.snapshot_volumes(cancel, source).await?;

            if source.is_running() {
                phase = ReplacementPhase::Stopping;
                self.lifecycle
                    .stop(cancel, &source.id)
                    .await
                    .map_err(|e| e.context("stop instance"))?;
            }

            phase = ReplacementPhase::Launching;
            let mut launched = guarded(
                cancel,
                self.gateway
                    .run_instances(&task.target_image, &source.instance_type),
            )
            .await
            .map_err(|e| e.context("run instances"))?;
            replacement_id = Some(launched.id.clone());
            tracing::info!(
                instance_id = %source.id,
                replacement_id = %launched.id,
                image = %task.target_image,
                "replacement launched"
            );

            phase = ReplacementPhase::TerminatingOld;
            guarded(cancel, self.gateway.terminate_instances(&[source.id.clone()]))
                .await
                .map_err(|e| e.context("terminate instance"))?;

            phase = ReplacementPhase::TagCopy;
            let carried = Self::carried_tags(source);
            if !carried.is_empty() {
                guarded(cancel, self.gateway.create_tags(&[launched.id.clone()], &carried))
                    .await
                    .map_err(|e| e.context("copy tags"))?;
            }
            launched.tags.merge(&carried);

            Ok::<_, MigrationError>(Replacement {
                instance: launched,
                snapshots,
            })
        }
        .await;

        outcome.map_err(|source| ReplacementError {
            phase,
            replacement_id,
            source,
        })
    }

    /// Tags carried from `source` to its replacement (everything but the status)
    #[must_use]
    pub fn carried_tags(source: &Instance) -> crate::types::TagSet {
        source.tags.without(tags::MIGRATE_STATUS)
    }
}

impl std::fmt::Debug for ReplacementStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplacementStage")
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}
