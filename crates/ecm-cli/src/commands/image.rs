//! Image commands - resolve and tag machine images.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use ecm_core::ImageCatalog;
use tokio_util::sync::CancellationToken;

use crate::{fleet, Config, OutputFormat};

/// Image subcommands.
#[derive(Debug, Subcommand)]
pub enum ImageCommand {
    /// Print the first image carrying a tag.
    Find(FindArgs),
    /// Set a tag on an image.
    Tag(TagArgs),
}

/// Arguments for `image find`.
#[derive(Debug, Args)]
pub struct FindArgs {
    /// Tag to match (`key=value`).
    #[arg(long, value_parser = crate::parse_tag)]
    pub tag: (String, String),
}

/// Arguments for `image tag`.
#[derive(Debug, Args)]
pub struct TagArgs {
    /// Image to tag.
    #[arg(long)]
    pub image_id: String,

    /// Tag to set (`key=value`).
    #[arg(long, value_parser = crate::parse_tag)]
    pub tag: (String, String),
}

/// Execute an image subcommand.
///
/// # Errors
///
/// Returns an error if no image matches, the provider call fails, or the
/// fleet file cannot be read or written.
pub async fn execute(command: ImageCommand, config: &Config) -> Result<()> {
    let gateway = fleet::load(&config.fleet)?;
    let catalog = ImageCatalog::new(gateway.clone());
    let cancel = CancellationToken::new();

    match command {
        ImageCommand::Find(args) => {
            let (key, value) = &args.tag;
            let image = catalog
                .find_by_tag(&cancel, key, value)
                .await?
                .with_context(|| format!("no image tagged {key}={value}"))?;
            match config.format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "image_id": image })),
                OutputFormat::Text => println!("{image}"),
            }
        }
        ImageCommand::Tag(args) => {
            let (key, value) = &args.tag;
            catalog.tag_image(&cancel, &args.image_id, key, value).await?;
            fleet::save(&config.fleet, &gateway)?;
            if config.format == OutputFormat::Text {
                println!("Tagged {} with {key}={value}", args.image_id);
            }
        }
    }
    Ok(())
}
