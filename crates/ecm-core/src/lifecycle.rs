//! Lifecycle controller
//!
//! Starts or stops a single instance and blocks until the provider reports
//! the target state. The wait is a fixed-interval poll of
//! `describe_instances`, bounded by `wait_timeout`. Like the provider SDK
//! waiters, a poll that observes a state the target can no longer be reached
//! from fails immediately instead of waiting out the bound. A freshly
//! launched id the provider does not know about yet counts as not yet
//! visible rather than as an error.

use crate::error::{MigrationError, ProviderError};
use crate::provider::{guarded, ProviderGateway};
use crate::types::InstanceState;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Starts and stops instances, waiting for the result
#[derive(Clone)]
pub struct LifecycleController {
    gateway: Arc<dyn ProviderGateway>,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl LifecycleController {
    /// Create new controller
    #[inline]
    #[must_use]
    pub fn new(gateway: Arc<dyn ProviderGateway>, poll_interval: Duration, wait_timeout: Duration) -> Self {
        Self {
            gateway,
            poll_interval,
            wait_timeout,
        }
    }

    /// Start `instance_id` and wait until it is running
    ///
    /// # Errors
    /// - `MigrationError::Provider` if the start call fails
    /// - `MigrationError::WaitTimeout` if it is not running within the bound
    /// - `MigrationError::UnexpectedState` if it stops or terminates instead
    pub async fn start(&self, cancel: &CancellationToken, instance_id: &str) -> Result<(), MigrationError> {
        tracing::info!(instance_id, "starting instance");
        let ids = [instance_id.to_string()];
        guarded(cancel, self.gateway.start_instances(&ids)).await?;
        self.wait_for(cancel, instance_id, InstanceState::Running).await
    }

    /// Stop `instance_id` and wait until it is stopped
    ///
    /// # Errors
    /// - `MigrationError::Provider` if the stop call fails
    /// - `MigrationError::WaitTimeout` if it is not stopped within the bound
    /// - `MigrationError::UnexpectedState` if it is started or terminates instead
    pub async fn stop(&self, cancel: &CancellationToken, instance_id: &str) -> Result<(), MigrationError> {
        tracing::info!(instance_id, "stopping instance");
        let ids = [instance_id.to_string()];
        guarded(cancel, self.gateway.stop_instances(&ids)).await?;
        self.wait_for(cancel, instance_id, InstanceState::Stopped).await
    }

    /// Poll until `instance_id` reports `target`
    ///
    /// # Errors
    /// See [`start`](Self::start) and [`stop`](Self::stop)
    pub async fn wait_for(
        &self,
        cancel: &CancellationToken,
        instance_id: &str,
        target: InstanceState,
    ) -> Result<(), MigrationError> {
        let started = Instant::now();
        let ids = [instance_id.to_string()];

        loop {
            let observed = match guarded(cancel, self.gateway.describe_instances(&ids)).await {
                Ok(instances) => instances
                    .into_iter()
                    .find(|i| i.id == instance_id)
                    .map(|i| i.state),
                Err(MigrationError::Provider(ProviderError::NotFound(_))) => None,
                Err(e) => return Err(e),
            };

            match observed {
                Some(state) if state == target => {
                    tracing::debug!(instance_id, %target, elapsed = ?started.elapsed(), "target state reached");
                    return Ok(());
                }
                Some(state) if is_unreachable(target, state) => {
                    return Err(MigrationError::UnexpectedState {
                        instance_id: instance_id.to_string(),
                        target,
                        observed: state,
                    });
                }
                Some(state) => tracing::debug!(instance_id, %state, %target, "waiting for state"),
                None => tracing::debug!(instance_id, %target, "instance not yet visible"),
            }

            let elapsed = started.elapsed();
            if elapsed >= self.wait_timeout {
                return Err(MigrationError::WaitTimeout {
                    instance_id: instance_id.to_string(),
                    target,
                    waited: elapsed,
                });
            }

            let pause = self.poll_interval.min(self.wait_timeout - elapsed);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(MigrationError::Cancelled),
                () = tokio::time::sleep(pause) => {}
            }
        }
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("poll_interval", &self.poll_interval)
            .field("wait_timeout", &self.wait_timeout)
            .finish_non_exhaustive()
    }
}

/// States from which `target` can no longer be reached without another call
fn is_unreachable(target: InstanceState, observed: InstanceState) -> bool {
    match target {
        InstanceState::Running => matches!(
            observed,
            InstanceState::Stopping | InstanceState::ShuttingDown | InstanceState::Terminated
        ),
        InstanceState::Stopped => matches!(
            observed,
            InstanceState::Pending | InstanceState::ShuttingDown | InstanceState::Terminated
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{InMemoryGateway, Operation};
    use crate::types::Instance;

    fn controller(gateway: &Arc<InMemoryGateway>) -> LifecycleController {
        LifecycleController::new(
            gateway.clone(),
            Duration::from_secs(10),
            Duration::from_secs(300),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_stopped() {
        let gateway = Arc::new(InMemoryGateway::new().with_settle_after(3));
        gateway.insert_instance(Instance::new("i-1", InstanceState::Running, "t3.micro"));

        controller(&gateway)
            .stop(&CancellationToken::new(), "i-1")
            .await
            .unwrap();

        assert_eq!(gateway.instance("i-1").unwrap().state, InstanceState::Stopped);
        assert_eq!(gateway.calls_of(Operation::DescribeInstances).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn start_waits_for_running() {
        let gateway = Arc::new(InMemoryGateway::new().with_settle_after(2));
        gateway.insert_instance(Instance::new("i-1", InstanceState::Stopped, "t3.micro"));

        controller(&gateway)
            .start(&CancellationToken::new(), "i-1")
            .await
            .unwrap();

        assert_eq!(gateway.instance("i-1").unwrap().state, InstanceState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stop_times_out_without_further_mutation() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.insert_instance(Instance::new("i-1", InstanceState::Running, "t3.micro"));
        gateway.stall("i-1");

        let started = Instant::now();
        let err = controller(&gateway)
            .stop(&CancellationToken::new(), "i-1")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MigrationError::WaitTimeout { target: InstanceState::Stopped, .. }
        ));
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(started.elapsed() < Duration::from_secs(311));
        assert_eq!(gateway.mutation_count(), 1);
    }

    #[tokio::test]
    async fn mutation_failure_propagates_without_polling() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.insert_instance(Instance::new("i-1", InstanceState::Running, "t3.micro"));
        gateway.fail(
            Operation::StopInstances,
            ProviderError::api("UnauthorizedOperation", "denied"),
        );

        let err = controller(&gateway)
            .stop(&CancellationToken::new(), "i-1")
            .await
            .unwrap_err();

        assert!(matches!(err, MigrationError::Provider(ProviderError::Api { .. })));
        assert!(gateway.calls_of(Operation::DescribeInstances).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_while_waiting_for_running_fails_fast() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.insert_instance(Instance::new("i-1", InstanceState::Terminated, "t3.micro"));

        let err = controller(&gateway)
            .wait_for(&CancellationToken::new(), "i-1", InstanceState::Running)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MigrationError::UnexpectedState { observed: InstanceState::Terminated, .. }
        ));
        assert_eq!(gateway.calls_of(Operation::DescribeInstances).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_id_keeps_polling_until_visible() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.insert_instance(Instance::new("i-1", InstanceState::Running, "t3.micro"));
        gateway.fail_for(
            Operation::DescribeInstances,
            "i-1",
            ProviderError::NotFound("i-1".into()),
        );

        let visible = gateway.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            visible.clear_faults();
        });

        controller(&gateway)
            .wait_for(&CancellationToken::new(), "i-1", InstanceState::Running)
            .await
            .unwrap();
        assert_eq!(gateway.calls_of(Operation::DescribeInstances).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn never_visible_id_times_out() {
        let gateway = Arc::new(InMemoryGateway::new());

        let err = controller(&gateway)
            .wait_for(&CancellationToken::new(), "i-404", InstanceState::Running)
            .await
            .unwrap_err();

        assert!(matches!(err, MigrationError::WaitTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_wait() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.insert_instance(Instance::new("i-1", InstanceState::Running, "t3.micro"));
        gateway.stall("i-1");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            trigger.cancel();
        });

        let err = controller(&gateway).stop(&cancel, "i-1").await.unwrap_err();
        assert!(matches!(err, MigrationError::Cancelled));
    }
}
