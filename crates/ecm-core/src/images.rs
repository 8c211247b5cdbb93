//! Image catalog
//!
//! Resolves machine images by tag, so a run can target "the image tagged
//! `release=2024.05`" instead of a literal id.

use crate::error::MigrationError;
use crate::provider::{guarded, ProviderGateway};
use crate::types::TagSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Tag-based image lookup
#[derive(Clone)]
pub struct ImageCatalog {
    gateway: Arc<dyn ProviderGateway>,
}

impl ImageCatalog {
    /// Create new catalog
    #[inline]
    #[must_use]
    pub fn new(gateway: Arc<dyn ProviderGateway>) -> Self {
        Self { gateway }
    }

    /// First image whose tag `key` equals `value`
    ///
    /// # Errors
    /// `MigrationError::Provider` if the query fails
    pub async fn find_by_tag(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: &str,
    ) -> Result<Option<String>, MigrationError> {
        let found = guarded(cancel, self.gateway.describe_images_by_tag(key, value))
            .await
            .map_err(|e| e.context("describe images"))?;

        if found.len() > 1 {
            tracing::debug!(key, value, matches = found.len(), "several images match, using the first");
        }
        Ok(found.into_iter().next())
    }

    /// Set tag `key=value` on `image_id`
    ///
    /// # Errors
    /// `MigrationError::Provider` if the tag call fails
    pub async fn tag_image(
        &self,
        cancel: &CancellationToken,
        image_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), MigrationError> {
        let tags = TagSet::new().with(key, value);
        guarded(cancel, self.gateway.create_tags(&[image_id.to_string()], &tags))
            .await
            .map_err(|e| e.context("tag image"))?;
        tracing::info!(image_id, key, value, "image tagged");
        Ok(())
    }
}

impl std::fmt::Debug for ImageCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCatalog").finish_non_exhaustive()
    }
}
