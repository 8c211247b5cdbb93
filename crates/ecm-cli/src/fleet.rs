//! Fleet file - JSON-backed simulated provider state.

use anyhow::{Context, Result};
use ecm_core::{FleetState, InMemoryGateway};
use std::path::Path;
use std::sync::Arc;

/// Load the gateway from `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid fleet JSON.
pub fn load(path: &Path) -> Result<Arc<InMemoryGateway>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read fleet file {}", path.display()))?;
    let state = FleetState::from_json(&text)
        .with_context(|| format!("invalid fleet file {}", path.display()))?;
    tracing::debug!(
        path = %path.display(),
        instances = state.instances.len(),
        images = state.images.len(),
        "fleet loaded"
    );
    Ok(Arc::new(InMemoryGateway::from_state(state)))
}

/// Write the gateway's current state back to `path`.
///
/// # Errors
///
/// Returns an error if the state cannot be serialized or written.
pub fn save(path: &Path, gateway: &InMemoryGateway) -> Result<()> {
    let json = gateway.state().to_json().context("failed to serialize fleet")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write fleet file {}", path.display()))?;
    tracing::debug!(path = %path.display(), "fleet saved");
    Ok(())
}
