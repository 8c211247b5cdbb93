//! Eligibility filter
//!
//! One tag query selects the candidates; `should_migrate` then decides per
//! instance:
//! - running instances also need `migrate-if-running=enabled`
//! - any other state is eligible on the primary marker alone

use crate::error::{MigrationError, SelectionError};
use crate::provider::{guarded, ProviderGateway};
use crate::tags;
use crate::types::Instance;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of the per-instance eligibility decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Include the instance in this run
    pub migrate: bool,
    /// Instance must be started before migrating and stopped again after
    pub needs_transient_start: bool,
}

/// Decide whether `instance` should be migrated
///
/// Assumes the primary marker already matched (the selection query filters on it).
#[must_use]
pub fn should_migrate(instance: &Instance) -> Decision {
    if instance.is_running() {
        return Decision {
            migrate: instance.tags.has(tags::MIGRATE_IF_RUNNING, tags::ENABLED),
            needs_transient_start: false,
        };
    }

    // Stopped instances are migrated as they are; nothing currently asks for
    // a start-then-restore cycle.
    Decision {
        migrate: true,
        needs_transient_start: false,
    }
}

/// Eligible instance together with its decision
#[derive(Debug, Clone)]
pub struct Candidate {
    pub instance: Instance,
    pub needs_transient_start: bool,
}

/// Outcome of one selection pass
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Instances to migrate
    pub eligible: Vec<Candidate>,
    /// Instances that matched the marker but failed the criteria
    pub skipped: Vec<Instance>,
}

impl Selection {
    /// Check if nothing matched at all
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.eligible.is_empty() && self.skipped.is_empty()
    }

    fn from_instances(instances: Vec<Instance>) -> Self {
        let mut selection = Selection::default();
        for instance in instances {
            let decision = should_migrate(&instance);
            if decision.migrate {
                selection.eligible.push(Candidate {
                    instance,
                    needs_transient_start: decision.needs_transient_start,
                });
            } else {
                selection.skipped.push(instance);
            }
        }
        selection
    }
}

/// Selects migration candidates from the provider
#[derive(Clone)]
pub struct EligibilityFilter {
    gateway: Arc<dyn ProviderGateway>,
}

impl EligibilityFilter {
    /// Create new filter
    #[inline]
    #[must_use]
    pub fn new(gateway: Arc<dyn ProviderGateway>) -> Self {
        Self { gateway }
    }

    /// Query instances tagged `migrate-enabled=<enabled_value>` and split them
    ///
    /// # Errors
    /// `SelectionError::Query` if the tag query fails
    pub async fn select(
        &self,
        cancel: &CancellationToken,
        enabled_value: &str,
    ) -> Result<Selection, SelectionError> {
        let instances = guarded(
            cancel,
            self.gateway
                .describe_instances_by_tag(tags::MIGRATE_ENABLED, enabled_value),
        )
        .await
        .map_err(into_selection_error)?;

        let selection = Selection::from_instances(instances);
        tracing::info!(
            eligible = selection.eligible.len(),
            skipped = selection.skipped.len(),
            enabled_value,
            "instances selected"
        );
        Ok(selection)
    }

    /// Select exactly `instance_id`, bypassing the tag query and the criteria
    ///
    /// # Errors
    /// - `SelectionError::InstanceNotFound` if the instance does not exist
    /// - `SelectionError::Query` on any other provider failure
    pub async fn select_instance(
        &self,
        cancel: &CancellationToken,
        instance_id: &str,
    ) -> Result<Selection, SelectionError> {
        let ids = [instance_id.to_string()];
        let found = guarded(cancel, self.gateway.describe_instances(&ids))
            .await
            .map_err(|e| match e {
                MigrationError::Provider(crate::error::ProviderError::NotFound(_)) => {
                    SelectionError::InstanceNotFound(instance_id.to_string())
                }
                other => into_selection_error(other),
            })?
            .into_iter()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| SelectionError::InstanceNotFound(instance_id.to_string()))?;

        tracing::info!(instance_id, state = %found.state, "instance selected by override");
        Ok(Selection {
            eligible: vec![Candidate {
                instance: found,
                needs_transient_start: false,
            }],
            skipped: Vec::new(),
        })
    }
}

impl std::fmt::Debug for EligibilityFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EligibilityFilter").finish_non_exhaustive()
    }
}

fn into_selection_error(error: MigrationError) -> SelectionError {
    match error {
        MigrationError::Provider(e) => SelectionError::Query(e),
        _ => SelectionError::Cancelled,
    }
}
