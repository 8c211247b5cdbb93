//! ecman Core - Fleet Image Migration Orchestrator
//!
//! Replaces tagged compute instances with instances launched from a new
//! machine image:
//! - Selects candidates by the `migrate-enabled` marker tag
//! - Snapshots every EBS volume before touching the instance
//! - Launches the replacement, terminates the source, carries tags forward
//! - Records each outcome as an audit tag triple on the provider
//!
//! # Example
//!
//! ```rust,ignore
//! use ecm_core::{MigrationConfig, MigrationOrchestrator};
//! use std::sync::Arc;
//!
//! # async fn example(gateway: Arc<dyn ecm_core::ProviderGateway>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = MigrationConfig::new("ami-0new").with_max_concurrency(8);
//! let orchestrator = MigrationOrchestrator::new(gateway, config)?;
//!
//! let report = orchestrator.migrate().await?;
//! println!("{} completed, {} failed", report.completed(), report.failed());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod backup;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod images;
pub mod lifecycle;
pub mod orchestrator;
pub mod provider;
pub mod replacement;
pub mod report;
pub mod status;
pub mod tags;
pub mod types;

// Re-exports for convenience
pub use backup::BackupStage;
pub use config::MigrationConfig;
pub use eligibility::{should_migrate, Candidate, Decision, EligibilityFilter, Selection};
pub use error::{ConfigError, MigrationError, ProviderError, SelectionError};
pub use images::ImageCatalog;
pub use lifecycle::LifecycleController;
pub use orchestrator::MigrationOrchestrator;
pub use provider::memory::{FleetState, GatewayCall, InMemoryGateway, Operation};
pub use provider::ProviderGateway;
pub use replacement::{ReplacementError, ReplacementPhase, ReplacementStage};
pub use report::{MigrationReport, TaskOutcome};
pub use status::StatusRecorder;
pub use types::{
    AuditStatus, BackingStore, Image, Instance, InstanceState, MigrationTask, TagSet,
    VolumeAttachment,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a migration
    pub use crate::{
        AuditStatus, Instance, InstanceState, MigrationConfig, MigrationOrchestrator,
        MigrationReport, ProviderGateway, TagSet,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
