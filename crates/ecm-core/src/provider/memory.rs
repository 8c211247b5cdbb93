//! In-memory provider gateway
//!
//! Simulates a compute provider well enough to drive the orchestrator end to
//! end:
//! - Lifecycle transitions settle after a configurable number of describe polls
//! - Faults can be injected per operation (optionally per resource)
//! - Every call is logged so callers can assert on the exact call sequence
//!
//! The whole fleet is a serializable `FleetState`, which lets the CLI keep a
//! simulated fleet in a JSON file between runs.

use crate::error::ProviderError;
use crate::provider::ProviderGateway;
use crate::types::{Image, Instance, InstanceState, TagSet, VolumeAttachment};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Gateway operation, used for call logs and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    DescribeImagesByTag,
    DescribeInstancesByTag,
    DescribeInstances,
    CreateSnapshot,
    RunInstances,
    TerminateInstances,
    StopInstances,
    StartInstances,
    CreateTags,
}

impl Operation {
    /// Check if the operation changes provider state
    #[inline]
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Operation::DescribeImagesByTag
                | Operation::DescribeInstancesByTag
                | Operation::DescribeInstances
        )
    }
}

/// One logged gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
    /// Operation invoked
    pub operation: Operation,
    /// Resource ids (or image/volume ids) the call named
    pub resources: Vec<String>,
    /// Tags written, for `CreateTags`
    pub tags: TagSet,
}

/// Recorded volume snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub description: String,
}

/// Complete simulated fleet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetState {
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
    #[serde(default)]
    pub images: BTreeMap<String, Image>,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    #[serde(default)]
    pub next_id: u64,
}

impl FleetState {
    /// Parse fleet JSON
    ///
    /// # Errors
    /// Returns the `serde_json` error on malformed input
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Render fleet as pretty JSON
    ///
    /// # Errors
    /// Returns the `serde_json` error if serialization fails
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08x}", self.next_id)
    }
}

#[derive(Debug, Clone)]
struct Fault {
    operation: Operation,
    resource: Option<String>,
    error: ProviderError,
}

impl Fault {
    fn matches(&self, operation: Operation, resources: &[String]) -> bool {
        self.operation == operation
            && self
                .resource
                .as_ref()
                .map_or(true, |r| resources.iter().any(|x| x == r))
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    target: InstanceState,
    remaining: u32,
}

#[derive(Debug, Default)]
struct Inner {
    fleet: FleetState,
    transitions: BTreeMap<String, Transition>,
    stalled: Vec<String>,
    faults: Vec<Fault>,
    calls: Vec<GatewayCall>,
}

/// Thread-safe simulated provider
#[derive(Debug)]
pub struct InMemoryGateway {
    inner: Mutex<Inner>,
    settle_after: u32,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryGateway {
    /// Create empty gateway; transitions settle on the next describe
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::from_state(FleetState::default())
    }

    /// Create gateway over an existing fleet
    #[must_use]
    pub fn from_state(fleet: FleetState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                fleet,
                ..Inner::default()
            }),
            settle_after: 1,
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// With number of describe polls before a transitional state settles
    #[inline]
    #[must_use]
    pub fn with_settle_after(mut self, polls: u32) -> Self {
        self.settle_after = polls;
        self
    }

    /// With artificial latency on every call
    #[inline]
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add or replace an instance
    pub fn insert_instance(&self, instance: Instance) {
        self.inner
            .lock()
            .fleet
            .instances
            .insert(instance.id.clone(), instance);
    }

    /// Add or replace an image
    pub fn insert_image(&self, id: impl Into<String>, tags: TagSet) {
        let id = id.into();
        self.inner
            .lock()
            .fleet
            .images
            .insert(id.clone(), Image { id, tags });
    }

    /// Fail every call of `operation` with `error`
    pub fn fail(&self, operation: Operation, error: ProviderError) {
        self.inner.lock().faults.push(Fault {
            operation,
            resource: None,
            error,
        });
    }

    /// Fail calls of `operation` that name `resource`
    pub fn fail_for(&self, operation: Operation, resource: impl Into<String>, error: ProviderError) {
        self.inner.lock().faults.push(Fault {
            operation,
            resource: Some(resource.into()),
            error,
        });
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    /// Keep `instance_id` in its transitional state forever
    pub fn stall(&self, instance_id: impl Into<String>) {
        self.inner.lock().stalled.push(instance_id.into());
    }

    /// Current view of one instance
    #[must_use]
    pub fn instance(&self, id: &str) -> Option<Instance> {
        self.inner.lock().fleet.instances.get(id).cloned()
    }

    /// Copy of the whole fleet
    #[must_use]
    pub fn state(&self) -> FleetState {
        self.inner.lock().fleet.clone()
    }

    /// All snapshots taken so far
    #[must_use]
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.inner.lock().fleet.snapshots.clone()
    }

    /// Every call made so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.inner.lock().calls.clone()
    }

    /// Calls of one operation, in order
    #[must_use]
    pub fn calls_of(&self, operation: Operation) -> Vec<GatewayCall> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    /// Number of state-changing calls made so far
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation.is_mutation())
            .count()
    }

    /// Highest number of calls observed in flight at once
    #[inline]
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        guard
    }

    /// Log the call, then fail it if a fault matches
    fn record(
        inner: &mut Inner,
        operation: Operation,
        resources: Vec<String>,
        tags: TagSet,
    ) -> Result<(), ProviderError> {
        let fault = inner
            .faults
            .iter()
            .find(|f| f.matches(operation, &resources))
            .map(|f| f.error.clone());
        inner.calls.push(GatewayCall {
            operation,
            resources,
            tags,
        });
        fault.map_or(Ok(()), Err)
    }

    fn begin_transition(
        inner: &mut Inner,
        id: &str,
        interim: InstanceState,
        target: InstanceState,
        polls: u32,
    ) {
        let Some(instance) = inner.fleet.instances.get_mut(id) else {
            return;
        };
        if polls == 0 && !inner.stalled.iter().any(|s| s == id) {
            instance.state = target;
            inner.transitions.remove(id);
        } else {
            instance.state = interim;
            inner.transitions.insert(
                id.to_string(),
                Transition {
                    target,
                    remaining: polls,
                },
            );
        }
    }

    fn advance(inner: &mut Inner, id: &str) {
        if inner.stalled.iter().any(|s| s == id) {
            return;
        }
        let Some(transition) = inner.transitions.get_mut(id) else {
            return;
        };
        transition.remaining = transition.remaining.saturating_sub(1);
        if transition.remaining == 0 {
            let target = transition.target;
            inner.transitions.remove(id);
            if let Some(instance) = inner.fleet.instances.get_mut(id) {
                instance.state = target;
            }
        }
    }

    fn require_instances(inner: &Inner, ids: &[String]) -> Result<(), ProviderError> {
        match ids.iter().find(|id| !inner.fleet.instances.contains_key(*id)) {
            Some(missing) => Err(ProviderError::NotFound(missing.clone())),
            None => Ok(()),
        }
    }

    fn incorrect_state(id: &str, state: InstanceState, action: &str) -> ProviderError {
        ProviderError::api(
            "IncorrectInstanceState",
            format!("instance {id} is {state} and cannot be {action}"),
        )
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ProviderGateway for InMemoryGateway {
    async fn describe_images_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let _guard = self.enter().await;
        let mut inner = self.inner.lock();
        Self::record(
            &mut inner,
            Operation::DescribeImagesByTag,
            vec![format!("{key}={value}")],
            TagSet::new(),
        )?;
        Ok(inner
            .fleet
            .images
            .values()
            .filter(|image| image.tags.has(key, value))
            .map(|image| image.id.clone())
            .collect())
    }

    async fn describe_instances_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<Instance>, ProviderError> {
        let _guard = self.enter().await;
        let mut inner = self.inner.lock();
        Self::record(
            &mut inner,
            Operation::DescribeInstancesByTag,
            vec![format!("{key}={value}")],
            TagSet::new(),
        )?;
        // Terminated instances age out of tag queries.
        Ok(inner
            .fleet
            .instances
            .values()
            .filter(|i| i.state != InstanceState::Terminated && i.tags.has(key, value))
            .cloned()
            .collect())
    }

    async fn describe_instances(&self, ids: &[String]) -> Result<Vec<Instance>, ProviderError> {
        let _guard = self.enter().await;
        let mut inner = self.inner.lock();
        Self::record(&mut inner, Operation::DescribeInstances, ids.to_vec(), TagSet::new())?;
        Self::require_instances(&inner, ids)?;
        for id in ids {
            Self::advance(&mut inner, id);
        }
        Ok(ids
            .iter()
            .filter_map(|id| inner.fleet.instances.get(id).cloned())
            .collect())
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
    ) -> Result<String, ProviderError> {
        let _guard = self.enter().await;
        let mut inner = self.inner.lock();
        Self::record(
            &mut inner,
            Operation::CreateSnapshot,
            vec![volume_id.to_string()],
            TagSet::new(),
        )?;
        let id = inner.fleet.allocate("snap");
        inner.fleet.snapshots.push(Snapshot {
            id: id.clone(),
            volume_id: volume_id.to_string(),
            description: description.to_string(),
        });
        Ok(id)
    }

    async fn run_instances(
        &self,
        image_id: &str,
        instance_type: &str,
    ) -> Result<Instance, ProviderError> {
        let _guard = self.enter().await;
        let mut inner = self.inner.lock();
        Self::record(
            &mut inner,
            Operation::RunInstances,
            vec![image_id.to_string(), instance_type.to_string()],
            TagSet::new(),
        )?;
        if !inner.fleet.images.contains_key(image_id) {
            return Err(ProviderError::api(
                "InvalidAMIID.NotFound",
                format!("image {image_id} does not exist"),
            ));
        }

        let id = inner.fleet.allocate("i");
        let volume = inner.fleet.allocate("vol");
        let mut instance = Instance::new(id.clone(), InstanceState::Pending, instance_type);
        instance.image_id = Some(image_id.to_string());
        instance.volumes.push(VolumeAttachment::ebs("/dev/xvda", volume));
        inner.fleet.instances.insert(id.clone(), instance);
        Self::begin_transition(
            &mut inner,
            &id,
            InstanceState::Pending,
            InstanceState::Running,
            self.settle_after,
        );

        inner
            .fleet
            .instances
            .get(&id)
            .cloned()
            .ok_or(ProviderError::NotFound(id))
    }

    async fn terminate_instances(&self, ids: &[String]) -> Result<(), ProviderError> {
        let _guard = self.enter().await;
        let mut inner = self.inner.lock();
        Self::record(&mut inner, Operation::TerminateInstances, ids.to_vec(), TagSet::new())?;
        Self::require_instances(&inner, ids)?;
        for id in ids {
            Self::begin_transition(
                &mut inner,
                id,
                InstanceState::ShuttingDown,
                InstanceState::Terminated,
                self.settle_after,
            );
        }
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String]) -> Result<(), ProviderError> {
        let _guard = self.enter().await;
        let mut inner = self.inner.lock();
        Self::record(&mut inner, Operation::StopInstances, ids.to_vec(), TagSet::new())?;
        Self::require_instances(&inner, ids)?;
        for id in ids {
            let state = inner.fleet.instances[id].state;
            match state {
                InstanceState::Stopped | InstanceState::Stopping => {}
                state @ (InstanceState::ShuttingDown | InstanceState::Terminated) => {
                    return Err(Self::incorrect_state(id, state, "stopped"));
                }
                InstanceState::Pending | InstanceState::Running => Self::begin_transition(
                    &mut inner,
                    id,
                    InstanceState::Stopping,
                    InstanceState::Stopped,
                    self.settle_after,
                ),
            }
        }
        Ok(())
    }

    async fn start_instances(&self, ids: &[String]) -> Result<(), ProviderError> {
        let _guard = self.enter().await;
        let mut inner = self.inner.lock();
        Self::record(&mut inner, Operation::StartInstances, ids.to_vec(), TagSet::new())?;
        Self::require_instances(&inner, ids)?;
        for id in ids {
            let state = inner.fleet.instances[id].state;
            match state {
                InstanceState::Running | InstanceState::Pending => {}
                state @ (InstanceState::ShuttingDown
                | InstanceState::Terminated
                | InstanceState::Stopping) => {
                    return Err(Self::incorrect_state(id, state, "started"));
                }
                InstanceState::Stopped => Self::begin_transition(
                    &mut inner,
                    id,
                    InstanceState::Pending,
                    InstanceState::Running,
                    self.settle_after,
                ),
            }
        }
        Ok(())
    }

    async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &TagSet,
    ) -> Result<(), ProviderError> {
        let _guard = self.enter().await;
        let mut inner = self.inner.lock();
        Self::record(&mut inner, Operation::CreateTags, resource_ids.to_vec(), tags.clone())?;

        let fleet = &mut inner.fleet;
        if let Some(missing) = resource_ids
            .iter()
            .find(|id| !fleet.instances.contains_key(*id) && !fleet.images.contains_key(*id))
        {
            return Err(ProviderError::NotFound(missing.clone()));
        }
        for id in resource_ids {
            if let Some(instance) = fleet.instances.get_mut(id) {
                instance.tags.merge(tags);
            } else if let Some(image) = fleet.images.get_mut(id) {
                image.tags.merge(tags);
            }
        }
        Ok(())
    }
}
