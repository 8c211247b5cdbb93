//! Core types for the orchestrator
//!
//! Point-in-time views of provider resources:
//! - Instances, their lifecycle state and volume attachments
//! - Tag sets
//! - Audit statuses and per-run migration tasks

use crate::tags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Instance lifecycle state as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Launching or starting
    Pending,
    /// Running
    Running,
    /// Stop in progress
    Stopping,
    /// Stopped
    Stopped,
    /// Termination in progress
    ShuttingDown,
    /// Terminated
    Terminated,
}

impl InstanceState {
    /// All states, in lifecycle order
    pub const ALL: [InstanceState; 6] = [
        InstanceState::Pending,
        InstanceState::Running,
        InstanceState::Stopping,
        InstanceState::Stopped,
        InstanceState::ShuttingDown,
        InstanceState::Terminated,
    ];

    /// Wire name of the state
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
        }
    }

    /// Check if the instance is running
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, InstanceState::Running)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key/value tags on a resource (keys unique, order irrelevant)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    /// Create an empty tag set
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With an additional tag
    #[inline]
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or overwrite a tag
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Get a tag value
    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Check whether `key` is present with exactly `value`
    #[inline]
    #[must_use]
    pub fn has(&self, key: &str, value: &str) -> bool {
        self.get(key) == Some(value)
    }

    /// Merge `other` into self; keys in `other` win
    pub fn merge(&mut self, other: &TagSet) {
        for (key, value) in other.iter() {
            self.insert(key, value);
        }
    }

    /// Copy of this set without `key`
    #[must_use]
    pub fn without(&self, key: &str) -> TagSet {
        TagSet(
            self.0
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Iterate over `(key, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of tags
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        TagSet(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Backing store of a block device mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackingStore {
    /// Network block volume; snapshot-capable
    Ebs { volume_id: String },
    /// Ephemeral instance storage; cannot be snapshotted
    InstanceStore { virtual_name: String },
}

/// Storage attached to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    /// Device path on the instance (e.g. `/dev/xvda`)
    pub device_name: String,
    /// What backs the device
    pub store: BackingStore,
}

impl VolumeAttachment {
    /// EBS attachment
    #[inline]
    #[must_use]
    pub fn ebs(device_name: impl Into<String>, volume_id: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            store: BackingStore::Ebs {
                volume_id: volume_id.into(),
            },
        }
    }

    /// Instance-store attachment
    #[inline]
    #[must_use]
    pub fn instance_store(device_name: impl Into<String>, virtual_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            store: BackingStore::InstanceStore {
                virtual_name: virtual_name.into(),
            },
        }
    }

    /// Volume id, if the attachment can be snapshotted
    #[inline]
    #[must_use]
    pub fn snapshot_volume(&self) -> Option<&str> {
        match &self.store {
            BackingStore::Ebs { volume_id } => Some(volume_id),
            BackingStore::InstanceStore { .. } => None,
        }
    }
}

/// Point-in-time snapshot of a provider instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Provider instance id
    pub id: String,
    /// Lifecycle state
    pub state: InstanceState,
    /// Instance type / size class
    pub instance_type: String,
    /// Image the instance was launched from
    #[serde(default)]
    pub image_id: Option<String>,
    /// Attached storage
    #[serde(default)]
    pub volumes: Vec<VolumeAttachment>,
    /// Tags
    #[serde(default)]
    pub tags: TagSet,
}

impl Instance {
    /// Create an instance view with no volumes or tags
    #[must_use]
    pub fn new(id: impl Into<String>, state: InstanceState, instance_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state,
            instance_type: instance_type.into(),
            image_id: None,
            volumes: Vec::new(),
            tags: TagSet::new(),
        }
    }

    /// Check if running
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Current audit status, if one was recorded
    #[must_use]
    pub fn audit_status(&self) -> Option<AuditStatus> {
        self.tags.get(tags::MIGRATE_STATUS).and_then(AuditStatus::parse)
    }
}

/// Machine image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Provider image id
    pub id: String,
    /// Tags
    #[serde(default)]
    pub tags: TagSet,
}

/// Outcome written into the `migrate-status` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditStatus {
    /// Did not meet the eligibility criteria
    Skipped,
    /// Migration started
    InProgress,
    /// Migration failed
    Failed,
    /// Migration succeeded but a follow-up step failed
    Warning,
    /// Migration succeeded
    Completed,
}

impl AuditStatus {
    /// Tag value for this status
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Skipped => "skipped",
            AuditStatus::InProgress => "in-progress",
            AuditStatus::Failed => "failed",
            AuditStatus::Warning => "warning",
            AuditStatus::Completed => "completed",
        }
    }

    /// Parse a tag value
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "skipped" => Some(AuditStatus::Skipped),
            "in-progress" => Some(AuditStatus::InProgress),
            "failed" => Some(AuditStatus::Failed),
            "warning" => Some(AuditStatus::Warning),
            "completed" => Some(AuditStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instance selected for migration in the current run
#[derive(Debug, Clone)]
pub struct MigrationTask {
    /// Source instance as selected
    pub instance: Instance,
    /// Image to launch the replacement from
    pub target_image: String,
    /// Start the instance before migrating and restore the stopped state after
    pub needs_transient_start: bool,
}

impl MigrationTask {
    /// Create new task
    #[inline]
    #[must_use]
    pub fn new(instance: Instance, target_image: impl Into<String>) -> Self {
        Self {
            instance,
            target_image: target_image.into(),
            needs_transient_start: false,
        }
    }

    /// With transient start flag
    #[inline]
    #[must_use]
    pub fn with_transient_start(mut self, needs_transient_start: bool) -> Self {
        self.needs_transient_start = needs_transient_start;
        self
    }

    /// Source instance id
    #[inline]
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance.id
    }

    /// Check if the source must be started first (and stopped again after)
    #[inline]
    #[must_use]
    pub fn requires_start(&self) -> bool {
        self.needs_transient_start && !self.instance.is_running()
    }
}
