//! # ecm-cli
//!
//! Command-line interface for fleet image migration.
//!
//! ## Commands
//!
//! - `ecman migrate` - Replace tagged instances with ones on a new image
//! - `ecman image find` - Resolve an image id by tag
//! - `ecman image tag` - Tag an image
//!
//! ## Fleet
//!
//! Every command runs against a fleet file (`--fleet`, or `ECMAN_FLEET`): a
//! JSON snapshot of instances, images and snapshots. The file is rewritten
//! with the resulting state when a command finishes.

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]

pub mod commands;
pub mod fleet;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ecman - tag-driven fleet image migration.
#[derive(Debug, Parser)]
#[command(name = "ecman")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Fleet state file.
    #[arg(long, env = "ECMAN_FLEET", default_value = "fleet.json", global = true)]
    pub fleet: PathBuf,

    /// Log level, overridden by `RUST_LOG`.
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Get the effective configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            fleet: self.fleet.clone(),
            format: self.format,
        }
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Migrate tagged instances to a new image.
    Migrate(commands::migrate::MigrateArgs),
    /// Look up or tag images.
    #[command(subcommand)]
    Image(commands::image::ImageCommand),
}

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
}

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fleet state file.
    pub fleet: PathBuf,
    /// Output format.
    pub format: OutputFormat,
}

/// Parse a `key=value` tag argument.
///
/// # Errors
///
/// Returns a message if there is no `=` or the key is empty.
pub fn parse_tag(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commands::image::ImageCommand;

    #[test]
    fn migrate_flags_parse() {
        let cli = Cli::parse_from([
            "ecman",
            "--fleet",
            "/tmp/fleet.json",
            "--format",
            "json",
            "migrate",
            "--new-ami",
            "ami-0new",
            "--enabled-value",
            "wave-2",
            "--instance-id",
            "i-9",
            "--max-concurrency",
            "4",
        ]);

        let config = cli.config();
        assert_eq!(config.fleet, PathBuf::from("/tmp/fleet.json"));
        assert_eq!(config.format, OutputFormat::Json);
        let Commands::Migrate(args) = cli.command else {
            panic!("expected migrate");
        };
        assert_eq!(args.new_ami.as_deref(), Some("ami-0new"));
        assert_eq!(args.enabled_value.as_deref(), Some("wave-2"));
        assert_eq!(args.instance_id.as_deref(), Some("i-9"));
        assert_eq!(args.max_concurrency, Some(4));
    }

    #[test]
    fn new_ami_conflicts_with_image_tag() {
        let result = Cli::try_parse_from([
            "ecman",
            "migrate",
            "--new-ami",
            "ami-1",
            "--image-tag",
            "release=2024.05",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn image_tag_subcommand_parses_pair() {
        let cli = Cli::parse_from([
            "ecman",
            "image",
            "tag",
            "--image-id",
            "ami-1",
            "--tag",
            "release=2024.05",
        ]);
        let Commands::Image(ImageCommand::Tag(args)) = cli.command else {
            panic!("expected image tag");
        };
        assert_eq!(args.image_id, "ami-1");
        assert_eq!(args.tag, ("release".to_string(), "2024.05".to_string()));
    }

    #[test]
    fn parse_tag_rejects_missing_separator() {
        assert_eq!(parse_tag("a=b=c"), Ok(("a".into(), "b=c".into())));
        assert_eq!(parse_tag("k="), Ok(("k".into(), String::new())));
        assert!(parse_tag("novalue").is_err());
        assert!(parse_tag("=v").is_err());
    }
}
