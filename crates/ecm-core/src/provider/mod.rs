//! Provider gateway boundary
//!
//! The compute provider is an opaque RPC client. Everything the orchestrator
//! needs from it is expressed by `ProviderGateway`; implementations must be
//! safe to call from many tasks at once.
//!
//! Cancellation is applied by the caller: `guarded` races each call against
//! the run's `CancellationToken` and drops the in-flight future when the
//! token fires.

pub mod memory;

use crate::error::{MigrationError, ProviderError};
use crate::types::{Instance, TagSet};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Capability set consumed from the compute provider
#[async_trait::async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Image ids whose tag `key` equals `value`
    async fn describe_images_by_tag(&self, key: &str, value: &str)
        -> Result<Vec<String>, ProviderError>;

    /// Instances whose tag `key` equals `value`
    async fn describe_instances_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<Instance>, ProviderError>;

    /// Instances by id
    async fn describe_instances(&self, ids: &[String]) -> Result<Vec<Instance>, ProviderError>;

    /// Snapshot a volume; returns the snapshot id
    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
    ) -> Result<String, ProviderError>;

    /// Launch exactly one instance
    async fn run_instances(
        &self,
        image_id: &str,
        instance_type: &str,
    ) -> Result<Instance, ProviderError>;

    /// Terminate instances
    async fn terminate_instances(&self, ids: &[String]) -> Result<(), ProviderError>;

    /// Stop instances
    async fn stop_instances(&self, ids: &[String]) -> Result<(), ProviderError>;

    /// Start instances
    async fn start_instances(&self, ids: &[String]) -> Result<(), ProviderError>;

    /// Create or overwrite tags on resources
    async fn create_tags(&self, resource_ids: &[String], tags: &TagSet)
        -> Result<(), ProviderError>;
}

/// Run a provider call unless `cancel` fires first
///
/// # Errors
/// `MigrationError::Cancelled` if the token fired, otherwise the call's own error
pub async fn guarded<T, F>(cancel: &CancellationToken, call: F) -> Result<T, MigrationError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(MigrationError::Cancelled),
        result = call => result.map_err(MigrationError::from),
    }
}
