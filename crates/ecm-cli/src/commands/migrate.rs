//! Migrate command - replace tagged instances with ones on a new image.

use anyhow::{Context, Result};
use clap::Args;
use ecm_core::{ImageCatalog, MigrationConfig, MigrationOrchestrator, MigrationReport};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{fleet, Config, OutputFormat};

/// Arguments for the migrate command.
#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Image id to launch replacements from.
    #[arg(long)]
    pub new_ami: Option<String>,

    /// Resolve the target image by tag instead (`key=value`).
    #[arg(long, value_parser = crate::parse_tag, conflicts_with = "new_ami")]
    pub image_tag: Option<(String, String)>,

    /// Value `migrate-enabled` must carry (default `enabled`).
    #[arg(long)]
    pub enabled_value: Option<String>,

    /// Migrate only this instance, ignoring tags and state.
    #[arg(long)]
    pub instance_id: Option<String>,

    /// TOML file with migration settings; flags take precedence.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Deadline for the whole run, in seconds (none by default).
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Bound on each start/stop wait, in seconds.
    #[arg(long)]
    pub wait_timeout_secs: Option<u64>,

    /// Interval between lifecycle polls, in seconds.
    #[arg(long)]
    pub poll_interval_secs: Option<u64>,

    /// Maximum instances migrated at once.
    #[arg(long)]
    pub max_concurrency: Option<usize>,
}

impl MigrateArgs {
    /// Build the migration settings from the config file and flags.
    ///
    /// The target image is left as-is when `--image-tag` is used; it is
    /// resolved against the fleet later.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded.
    pub fn migration_config(&self) -> Result<MigrationConfig> {
        let mut config = match &self.config {
            Some(path) => MigrationConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => MigrationConfig::default(),
        };

        if let Some(image) = &self.new_ami {
            config.target_image.clone_from(image);
        }
        if let Some(value) = &self.enabled_value {
            config.enabled_value.clone_from(value);
        }
        if let Some(id) = &self.instance_id {
            config.instance_override = Some(id.clone());
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = self.wait_timeout_secs {
            config.wait_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_concurrency {
            config.max_concurrency = max;
        }
        Ok(config)
    }
}

/// Execute the migrate command.
///
/// Failed instances are reported, not returned as errors.
///
/// # Errors
///
/// Returns an error if the settings are invalid, the target image tag
/// matches nothing, instance selection fails, or the fleet file cannot be
/// read or written.
pub async fn execute(args: MigrateArgs, config: &Config) -> Result<()> {
    let mut settings = args.migration_config()?;
    let gateway = fleet::load(&config.fleet)?;
    let cancel = CancellationToken::new();

    if let Some((key, value)) = &args.image_tag {
        settings.target_image = ImageCatalog::new(gateway.clone())
            .find_by_tag(&cancel, key, value)
            .await?
            .with_context(|| format!("no image tagged {key}={value}"))?;
        tracing::info!(image = %settings.target_image, "target image resolved by tag");
    }

    let orchestrator =
        MigrationOrchestrator::new(gateway.clone(), settings).context("invalid migration settings")?;

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling migration");
            interrupt.cancel();
        }
    });

    let result = orchestrator.migrate_with_cancel(cancel).await;
    fleet::save(&config.fleet, &gateway)?;
    let report = result.context("migration aborted")?;

    print_report(&report, config.format)
}

fn print_report(report: &MigrationReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text if report.is_empty() => println!("No instances matched"),
        OutputFormat::Text => print!("{}", report.generate_text()),
    }
    Ok(())
}
