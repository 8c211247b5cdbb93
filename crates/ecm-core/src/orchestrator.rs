//! Migration orchestrator
//!
//! Runs the eligibility filter once, then fans out one task per eligible
//! instance. Fan-out is gated by a semaphore sized from
//! `MigrationConfig::max_concurrency`, and the call returns only after every
//! task has finished.
//!
//! Task failures never fail the run. Each one is written to the instance's
//! audit tags and returned in the `MigrationReport`; only a failed selection
//! surfaces as `Err`.

use crate::config::MigrationConfig;
use crate::eligibility::EligibilityFilter;
use crate::error::{ConfigError, MigrationError, SelectionError};
use crate::lifecycle::LifecycleController;
use crate::provider::ProviderGateway;
use crate::replacement::ReplacementStage;
use crate::report::{MigrationReport, TaskOutcome};
use crate::status::StatusRecorder;
use crate::types::{AuditStatus, MigrationTask};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Audit message for instances that fail the criteria
pub const SKIPPED_MESSAGE: &str = "criteria not met";

/// Audit message for tasks that ended without an outcome
pub const ABORTED_MESSAGE: &str = "migration task aborted";

/// Drives a migration run across the fleet
#[derive(Debug)]
pub struct MigrationOrchestrator {
    config: MigrationConfig,
    filter: EligibilityFilter,
    worker: TaskRunner,
}

impl MigrationOrchestrator {
    /// Create orchestrator over `gateway`
    ///
    /// # Errors
    /// `ConfigError` if `config` fails validation
    pub fn new(gateway: Arc<dyn ProviderGateway>, config: MigrationConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let lifecycle =
            LifecycleController::new(gateway.clone(), config.poll_interval, config.wait_timeout);
        Ok(Self {
            filter: EligibilityFilter::new(gateway.clone()),
            worker: TaskRunner {
                recorder: StatusRecorder::new(gateway.clone()),
                replacement: ReplacementStage::new(gateway, lifecycle.clone()),
                lifecycle,
            },
            config,
        })
    }

    /// Get configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Run a migration, bounded by the configured timeout if one is set
    ///
    /// # Errors
    /// `SelectionError` if candidates could not be selected; task failures
    /// are reported in the returned `MigrationReport` instead
    pub async fn migrate(&self) -> Result<MigrationReport, SelectionError> {
        self.migrate_with_cancel(CancellationToken::new()).await
    }

    /// Run a migration that also stops when `cancel` fires
    ///
    /// # Errors
    /// See [`migrate`](Self::migrate)
    pub async fn migrate_with_cancel(
        &self,
        cancel: CancellationToken,
    ) -> Result<MigrationReport, SelectionError> {
        let run = cancel.child_token();
        let deadline = self.config.timeout.map(|timeout| {
            let run = run.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => {
                        tracing::warn!(timeout_secs = timeout.as_secs(), "migration deadline reached, cancelling");
                        run.cancel();
                    }
                    () = run.cancelled() => {}
                }
            })
        });

        let result = self.run(&run).await;
        if let Some(deadline) = deadline {
            deadline.abort();
        }
        result
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<MigrationReport, SelectionError> {
        tracing::info!(
            target_image = %self.config.target_image,
            enabled_value = %self.config.enabled_value,
            "starting migration run"
        );

        let selection = match &self.config.instance_override {
            Some(instance_id) => self.filter.select_instance(cancel, instance_id).await,
            None => self.filter.select(cancel, &self.config.enabled_value).await,
        }
        .map_err(|e| {
            tracing::error!(error = %e, "instance selection failed");
            e
        })?;

        if selection.is_empty() {
            tracing::info!("no instances matched, nothing to migrate");
            return Ok(MigrationReport::default());
        }

        let mut outcomes = Vec::with_capacity(selection.eligible.len() + selection.skipped.len());
        for instance in &selection.skipped {
            tracing::info!(instance_id = %instance.id, state = %instance.state, "skipping instance");
            self.worker
                .recorder
                .record_best_effort(cancel, &instance.id, AuditStatus::Skipped, SKIPPED_MESSAGE)
                .await;
            outcomes.push(TaskOutcome::new(&instance.id, AuditStatus::Skipped, SKIPPED_MESSAGE));
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut pending = BTreeSet::new();
        let mut tasks = JoinSet::new();
        for candidate in selection.eligible {
            let task = MigrationTask::new(candidate.instance, &self.config.target_image)
                .with_transient_start(candidate.needs_transient_start);
            pending.insert(task.instance_id().to_string());
            let worker = self.worker.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                worker.run(&cancel, task).await
            });
        }

        // Join barrier: every task finishes before the run returns.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    pending.remove(&outcome.instance_id);
                    outcomes.push(outcome);
                }
                Err(e) => tracing::error!(error = %e, "migration task aborted"),
            }
        }
        let audit = CancellationToken::new();
        for instance_id in pending {
            self.worker
                .recorder
                .record_best_effort(&audit, &instance_id, AuditStatus::Failed, ABORTED_MESSAGE)
                .await;
            outcomes.push(TaskOutcome::new(instance_id, AuditStatus::Failed, ABORTED_MESSAGE));
        }

        let report = MigrationReport::from_outcomes(outcomes);
        tracing::info!(
            completed = report.completed(),
            warnings = report.warnings(),
            failed = report.failed(),
            skipped = report.skipped(),
            "migration run finished"
        );
        Ok(report)
    }
}

/// Per-instance task sequence
#[derive(Debug, Clone)]
struct TaskRunner {
    recorder: StatusRecorder,
    lifecycle: LifecycleController,
    replacement: ReplacementStage,
}

impl TaskRunner {
    async fn run(&self, cancel: &CancellationToken, task: MigrationTask) -> TaskOutcome {
        let source_id = task.instance_id().to_string();
        // Terminal audit writes still go out after the run is cancelled.
        let audit = CancellationToken::new();

        tracing::info!(instance_id = %source_id, state = %task.instance.state, "migrating instance");
        self.recorder
            .record_best_effort(cancel, &source_id, AuditStatus::InProgress, "Starting migration")
            .await;

        if task.requires_start() {
            if let Err(e) = self.lifecycle.start(cancel, &source_id).await {
                let message = format!("Failed to start instance: {e}");
                tracing::warn!(instance_id = %source_id, error = %e, "migration failed");
                self.recorder
                    .record_best_effort(&audit, &source_id, AuditStatus::Failed, &message)
                    .await;
                let mut outcome = TaskOutcome::new(&source_id, AuditStatus::Failed, message);
                outcome.retryable = e.is_retryable();
                return outcome;
            }
        }

        let replacement = match self.replacement.replace(cancel, &task).await {
            Ok(replacement) => replacement,
            Err(e) => {
                let message = format!("Failed to upgrade instance: {e}");
                tracing::warn!(
                    instance_id = %source_id,
                    phase = %e.phase,
                    replacement_id = ?e.replacement_id,
                    cancelled = e.source.is_cancelled(),
                    error = %e,
                    "migration failed"
                );
                self.recorder
                    .record_best_effort(&audit, &source_id, AuditStatus::Failed, &message)
                    .await;
                let mut outcome = TaskOutcome::new(&source_id, AuditStatus::Failed, message);
                outcome.retryable = e.source.is_retryable();
                outcome.failed_phase = Some(e.phase);
                outcome.replacement_id = e.replacement_id;
                return outcome;
            }
        };
        let new_id = replacement.instance.id.clone();

        let (status, message) = match self.restore_stopped(cancel, &task, &new_id).await {
            Ok(()) => (
                AuditStatus::Completed,
                "Migration completed successfully".to_string(),
            ),
            Err(e) => (
                AuditStatus::Warning,
                format!("Migration successful but failed to stop instance: {e}"),
            ),
        };

        for id in [&new_id, &source_id] {
            self.recorder
                .record_best_effort(&audit, id, status, &message)
                .await;
        }
        tracing::info!(instance_id = %source_id, replacement_id = %new_id, %status, "migration finished");

        let mut outcome = TaskOutcome::new(&source_id, status, message);
        outcome.replacement_id = Some(new_id);
        outcome.snapshots = replacement.snapshots;
        outcome
    }

    /// Stop the replacement again if the source was only started for the migration
    async fn restore_stopped(
        &self,
        cancel: &CancellationToken,
        task: &MigrationTask,
        replacement_id: &str,
    ) -> Result<(), MigrationError> {
        if task.requires_start() {
            self.lifecycle.stop(cancel, replacement_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::memory::{InMemoryGateway, Operation};
    use crate::tags;
    use crate::types::{Instance, InstanceState, TagSet, VolumeAttachment};
    use std::time::Duration;

    fn marked(id: &str, state: InstanceState) -> Instance {
        let mut instance = Instance::new(id, state, "t3.micro");
        instance.tags = TagSet::new()
            .with(tags::MIGRATE_ENABLED, tags::ENABLED)
            .with("Name", id);
        instance
    }

    fn config() -> MigrationConfig {
        MigrationConfig::new("ami-new")
            .with_poll_interval(Duration::from_secs(1))
            .with_wait_timeout(Duration::from_secs(30))
    }

    fn gateway() -> Arc<InMemoryGateway> {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.insert_image("ami-new", TagSet::new());
        gateway
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let err = MigrationOrchestrator::new(gateway(), config().with_max_concurrency(0)).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroConcurrency));
    }

    #[tokio::test]
    async fn nothing_eligible_is_a_noop() {
        let gateway = gateway();
        let mut unmarked = Instance::new("i-7", InstanceState::Stopped, "t3.micro");
        unmarked.tags.insert(tags::MIGRATE_ENABLED, "later");
        gateway.insert_instance(unmarked);

        let report = MigrationOrchestrator::new(gateway.clone(), config())
            .unwrap()
            .migrate()
            .await
            .unwrap();

        assert!(report.is_empty());
        assert_eq!(gateway.mutation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn running_without_marker_skipped_and_stopped_migrated() {
        let gateway = gateway();
        gateway.insert_instance(marked("i-1", InstanceState::Running));
        let mut stopped = marked("i-2", InstanceState::Stopped);
        stopped.volumes = vec![
            VolumeAttachment::ebs("/dev/xvda", "vol-1"),
            VolumeAttachment::ebs("/dev/xvdf", "vol-2"),
        ];
        gateway.insert_instance(stopped);

        let report = MigrationOrchestrator::new(gateway.clone(), config())
            .unwrap()
            .migrate()
            .await
            .unwrap();

        let skipped = report.outcome("i-1").unwrap();
        assert_eq!(skipped.status, AuditStatus::Skipped);
        let i1 = gateway.instance("i-1").unwrap();
        assert_eq!(i1.state, InstanceState::Running);
        assert_eq!(i1.audit_status(), Some(AuditStatus::Skipped));
        assert_eq!(i1.tags.get(tags::MIGRATE_MESSAGE), Some(SKIPPED_MESSAGE));

        let done = report.outcome("i-2").unwrap();
        assert_eq!(done.status, AuditStatus::Completed);
        assert_eq!(done.snapshots.len(), 2);
        let new_id = done.replacement_id.clone().unwrap();

        let replacement = gateway.instance(&new_id).unwrap();
        assert_eq!(replacement.image_id.as_deref(), Some("ami-new"));
        assert_eq!(replacement.audit_status(), Some(AuditStatus::Completed));
        assert_eq!(replacement.tags.get("Name"), Some("i-2"));
        assert_eq!(
            replacement.tags.get(tags::MIGRATE_MESSAGE),
            Some("Migration completed successfully")
        );

        let source = gateway.instance("i-2").unwrap();
        assert_eq!(source.state, InstanceState::ShuttingDown);
        assert_eq!(source.audit_status(), Some(AuditStatus::Completed));
        assert!(gateway.snapshots().iter().all(|s| s.volume_id.starts_with("vol-")));
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_respects_max_concurrency() {
        let gateway = Arc::new(InMemoryGateway::new().with_latency(Duration::from_millis(50)));
        gateway.insert_image("ami-new", TagSet::new());
        for n in 0..6 {
            gateway.insert_instance(marked(&format!("i-{n}"), InstanceState::Stopped));
        }

        let report = MigrationOrchestrator::new(gateway.clone(), config().with_max_concurrency(2))
            .unwrap()
            .migrate()
            .await
            .unwrap();

        assert_eq!(report.completed(), 6);
        assert_eq!(gateway.max_in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_stuck_task_and_records_failure() {
        let gateway = gateway();
        let mut running = marked("i-3", InstanceState::Running);
        running.tags.insert(tags::MIGRATE_IF_RUNNING, tags::ENABLED);
        gateway.insert_instance(running);
        gateway.stall("i-3");

        let config = config()
            .with_wait_timeout(Duration::from_secs(300))
            .with_timeout(Duration::from_secs(20));
        let report = MigrationOrchestrator::new(gateway.clone(), config)
            .unwrap()
            .migrate()
            .await
            .unwrap();

        let outcome = report.outcome("i-3").unwrap();
        assert_eq!(outcome.status, AuditStatus::Failed);
        assert_eq!(
            outcome.message,
            "Failed to upgrade instance: stop instance: operation cancelled"
        );
        assert!(gateway.calls_of(Operation::RunInstances).is_empty());
        assert_eq!(gateway.instance("i-3").unwrap().audit_status(), Some(AuditStatus::Failed));
    }

    #[tokio::test]
    async fn external_cancel_before_selection_aborts_run() {
        let gateway = gateway();
        gateway.insert_instance(marked("i-2", InstanceState::Stopped));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = MigrationOrchestrator::new(gateway.clone(), config())
            .unwrap()
            .migrate_with_cancel(cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SelectionError::Cancelled));
        assert_eq!(gateway.mutation_count(), 0);
    }

    fn opted_in_running(id: &str) -> Instance {
        let mut running = marked(id, InstanceState::Running);
        running.tags.insert(tags::MIGRATE_IF_RUNNING, tags::ENABLED);
        running
    }

    #[tokio::test(start_paused = true)]
    async fn queued_tasks_are_not_cut_short_under_defaults() {
        let gateway = Arc::new(InMemoryGateway::new().with_settle_after(20));
        gateway.insert_image("ami-new", TagSet::new());
        for n in 0..20 {
            gateway.insert_instance(opted_in_running(&format!("i-{n}")));
        }

        let report = MigrationOrchestrator::new(gateway.clone(), MigrationConfig::new("ami-new"))
            .unwrap()
            .migrate()
            .await
            .unwrap();

        assert_eq!(report.completed(), 20);
        assert_eq!(report.failed(), 0);
        assert_eq!(gateway.calls_of(Operation::RunInstances).len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stop_times_out_under_defaults() {
        let gateway = gateway();
        gateway.insert_instance(opted_in_running("i-3"));
        gateway.stall("i-3");

        let report = MigrationOrchestrator::new(gateway.clone(), MigrationConfig::new("ami-new"))
            .unwrap()
            .migrate()
            .await
            .unwrap();

        let outcome = report.outcome("i-3").unwrap();
        assert_eq!(outcome.status, AuditStatus::Failed);
        assert!(outcome
            .message
            .starts_with("Failed to upgrade instance: stop instance: timed out after 300s"));
        assert!(outcome.retryable);
        assert_eq!(outcome.failed_phase, Some(crate::replacement::ReplacementPhase::Stopping));
    }

    /// Simulator that panics instead of launching
    struct PanicOnLaunch(Arc<InMemoryGateway>);

    #[async_trait::async_trait]
    impl ProviderGateway for PanicOnLaunch {
        async fn describe_images_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>, ProviderError> {
            self.0.describe_images_by_tag(key, value).await
        }

        async fn describe_instances_by_tag(&self, key: &str, value: &str) -> Result<Vec<Instance>, ProviderError> {
            self.0.describe_instances_by_tag(key, value).await
        }

        async fn describe_instances(&self, ids: &[String]) -> Result<Vec<Instance>, ProviderError> {
            self.0.describe_instances(ids).await
        }

        async fn create_snapshot(&self, volume_id: &str, description: &str) -> Result<String, ProviderError> {
            self.0.create_snapshot(volume_id, description).await
        }

        async fn run_instances(&self, _image_id: &str, _instance_type: &str) -> Result<Instance, ProviderError> {
            panic!("launch crashed");
        }

        async fn terminate_instances(&self, ids: &[String]) -> Result<(), ProviderError> {
            self.0.terminate_instances(ids).await
        }

        async fn stop_instances(&self, ids: &[String]) -> Result<(), ProviderError> {
            self.0.stop_instances(ids).await
        }

        async fn start_instances(&self, ids: &[String]) -> Result<(), ProviderError> {
            self.0.start_instances(ids).await
        }

        async fn create_tags(&self, resource_ids: &[String], tags: &TagSet) -> Result<(), ProviderError> {
            self.0.create_tags(resource_ids, tags).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicked_task_still_leaves_failed_audit() {
        let gateway = gateway();
        gateway.insert_instance(marked("i-2", InstanceState::Stopped));
        gateway.insert_instance(marked("i-4", InstanceState::Stopped));

        let report = MigrationOrchestrator::new(Arc::new(PanicOnLaunch(gateway.clone())), config())
            .unwrap()
            .migrate()
            .await
            .unwrap();

        assert_eq!(report.failed(), 2);
        for id in ["i-2", "i-4"] {
            assert_eq!(report.outcome(id).unwrap().message, ABORTED_MESSAGE);
            let instance = gateway.instance(id).unwrap();
            assert_eq!(instance.audit_status(), Some(AuditStatus::Failed));
            assert_eq!(instance.tags.get(tags::MIGRATE_MESSAGE), Some(ABORTED_MESSAGE));
            assert_eq!(instance.state, InstanceState::Stopped);
        }
    }

    fn runner(gateway: &Arc<InMemoryGateway>) -> TaskRunner {
        let lifecycle =
            LifecycleController::new(gateway.clone(), Duration::from_secs(1), Duration::from_secs(30));
        TaskRunner {
            recorder: StatusRecorder::new(gateway.clone()),
            replacement: ReplacementStage::new(gateway.clone(), lifecycle.clone()),
            lifecycle,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_start_stops_replacement_afterwards() {
        let gateway = gateway();
        gateway.insert_instance(marked("i-s", InstanceState::Stopped));
        let task = MigrationTask::new(marked("i-s", InstanceState::Stopped), "ami-new")
            .with_transient_start(true);

        let outcome = runner(&gateway).run(&CancellationToken::new(), task).await;

        assert_eq!(outcome.status, AuditStatus::Completed);
        let new_id = outcome.replacement_id.unwrap();
        assert_eq!(gateway.instance(&new_id).unwrap().state, InstanceState::Stopped);
        assert_eq!(gateway.calls_of(Operation::StartInstances).len(), 1);
        assert_eq!(
            gateway.calls_of(Operation::StopInstances)[0].resources,
            vec![new_id]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_transient_stop_is_a_warning() {
        let gateway = gateway();
        gateway.insert_instance(marked("i-s", InstanceState::Stopped));
        gateway.fail_for(
            Operation::StopInstances,
            "i-00000001",
            crate::error::ProviderError::api("IncorrectInstanceState", "busy"),
        );
        let task = MigrationTask::new(marked("i-s", InstanceState::Stopped), "ami-new")
            .with_transient_start(true);

        let outcome = runner(&gateway).run(&CancellationToken::new(), task).await;

        assert_eq!(outcome.status, AuditStatus::Warning);
        assert_eq!(
            outcome.message,
            "Migration successful but failed to stop instance: IncorrectInstanceState: busy"
        );
        for id in ["i-00000001", "i-s"] {
            assert_eq!(gateway.instance(id).unwrap().audit_status(), Some(AuditStatus::Warning));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_transient_start_never_replaces() {
        let gateway = gateway();
        gateway.insert_instance(marked("i-s", InstanceState::Stopped));
        gateway.fail(
            Operation::StartInstances,
            crate::error::ProviderError::Throttled("slow down".into()),
        );
        let task = MigrationTask::new(marked("i-s", InstanceState::Stopped), "ami-new")
            .with_transient_start(true);

        let outcome = runner(&gateway).run(&CancellationToken::new(), task).await;

        assert_eq!(outcome.status, AuditStatus::Failed);
        assert!(outcome.retryable);
        assert_eq!(
            outcome.message,
            "Failed to start instance: request throttled: slow down"
        );
        assert!(gateway.calls_of(Operation::CreateSnapshot).is_empty());
        assert!(gateway.calls_of(Operation::RunInstances).is_empty());
    }
}
