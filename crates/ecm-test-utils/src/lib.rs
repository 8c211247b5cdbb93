//! Testing utilities for ecman workspace
//!
//! Shared fleet fixtures, a fast-polling config, and audit assertions.

#![allow(missing_docs)]

use ecm_core::tags;
use ecm_core::{
    AuditStatus, InMemoryGateway, Instance, InstanceState, MigrationConfig, MigrationOrchestrator,
    TagSet, VolumeAttachment,
};
use std::sync::Arc;
use std::time::Duration;

/// Image every fixture gateway knows about
pub const TARGET_IMAGE: &str = "ami-new";

/// Fluent builder for fleet instances
#[derive(Debug, Clone)]
pub struct InstanceBuilder {
    instance: Instance,
}

impl InstanceBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            instance: Instance::new(id, InstanceState::Stopped, "t3.micro"),
        }
    }

    pub fn state(mut self, state: InstanceState) -> Self {
        self.instance.state = state;
        self
    }

    pub fn running(self) -> Self {
        self.state(InstanceState::Running)
    }

    pub fn instance_type(mut self, instance_type: &str) -> Self {
        self.instance.instance_type = instance_type.to_string();
        self
    }

    pub fn image(mut self, image_id: &str) -> Self {
        self.instance.image_id = Some(image_id.to_string());
        self
    }

    /// Attach EBS volumes `vol-<id>-0`, `vol-<id>-1`, ...
    pub fn ebs_volumes(mut self, count: usize) -> Self {
        for n in 0..count {
            let device = format!("/dev/xvd{}", char::from(b'a' + (n % 26) as u8));
            let volume = format!("vol-{}-{n}", self.instance.id);
            self.instance.volumes.push(VolumeAttachment::ebs(device, volume));
        }
        self
    }

    pub fn instance_store(mut self, device: &str, virtual_name: &str) -> Self {
        self.instance
            .volumes
            .push(VolumeAttachment::instance_store(device, virtual_name));
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.instance.tags.insert(key, value);
        self
    }

    /// `migrate-enabled=enabled`
    pub fn enabled(self) -> Self {
        self.tag(tags::MIGRATE_ENABLED, tags::ENABLED)
    }

    /// `migrate-if-running=enabled`
    pub fn if_running(self) -> Self {
        self.tag(tags::MIGRATE_IF_RUNNING, tags::ENABLED)
    }

    pub fn build(self) -> Instance {
        self.instance
    }
}

/// Config with a one-second poll and a short wait bound
pub fn fast_config() -> MigrationConfig {
    MigrationConfig::new(TARGET_IMAGE)
        .with_poll_interval(Duration::from_secs(1))
        .with_wait_timeout(Duration::from_secs(30))
}

/// Gateway seeded with `TARGET_IMAGE` and `instances`
pub fn setup_gateway(instances: impl IntoIterator<Item = Instance>) -> Arc<InMemoryGateway> {
    let gateway = Arc::new(InMemoryGateway::new());
    gateway.insert_image(TARGET_IMAGE, TagSet::new());
    for instance in instances {
        gateway.insert_instance(instance);
    }
    gateway
}

pub fn setup_orchestrator(gateway: &Arc<InMemoryGateway>, config: MigrationConfig) -> MigrationOrchestrator {
    MigrationOrchestrator::new(gateway.clone(), config).unwrap()
}

/// Assert the audit triple on `instance_id`
pub fn assert_audit(gateway: &InMemoryGateway, instance_id: &str, status: AuditStatus, message: &str) {
    let instance = gateway
        .instance(instance_id)
        .unwrap_or_else(|| panic!("instance {instance_id} not in fleet"));
    assert_eq!(
        instance.audit_status(),
        Some(status),
        "audit status of {instance_id}"
    );
    assert_eq!(
        instance.tags.get(tags::MIGRATE_MESSAGE),
        Some(message),
        "audit message of {instance_id}"
    );
    assert!(
        instance.tags.get(tags::MIGRATE_TIMESTAMP).is_some(),
        "audit timestamp of {instance_id}"
    );
}
