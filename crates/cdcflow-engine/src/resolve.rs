//! Connector, checkpoint store, and state scope resolution for a capture.

use std::sync::Arc;

use anyhow::{Context, Result};
use cdcflow_state::{CheckpointStore, SqliteCheckpointStore, StateScope};

use crate::config::types::{CaptureConfig, StateConfig};
use crate::connector::Connector;
use crate::replay::ReplayConnector;

/// Connector kinds this build can run.
pub const KNOWN_CONNECTORS: &[&str] = &["replay"];

/// Resolve `source.use` to a connector.
///
/// # Errors
///
/// Returns an error if the connector kind is unknown.
pub fn resolve_connector(use_ref: &str) -> Result<Arc<dyn Connector>> {
    match use_ref.trim() {
        "replay" => Ok(Arc::new(ReplayConnector)),
        other => anyhow::bail!(
            "Unknown connector '{other}', expected one of: {}",
            KNOWN_CONNECTORS.join(", ")
        ),
    }
}

/// Open the checkpoint store named by `state.store`.
///
/// # Errors
///
/// Returns an error if the database cannot be opened.
pub fn create_checkpoint_store(state: &StateConfig) -> Result<Arc<dyn CheckpointStore>> {
    let mut store = SqliteCheckpointStore::open(&state.store).with_context(|| {
        format!("Failed to open checkpoint store {}", state.store.display())
    })?;
    if let Some(ttl) = state.ttl {
        store = store.with_ttl(ttl);
    }
    tracing::debug!(path = %state.store.display(), "Checkpoint store opened");
    Ok(Arc::new(store) as Arc<dyn CheckpointStore>)
}

/// Scope under which this capture's checkpoints live.
#[must_use]
pub fn state_scope(config: &CaptureConfig) -> StateScope {
    let mut scope = StateScope::new(config.state.name.clone());
    if let Some(flow) = &config.flow {
        scope = scope.with_flow(flow.clone());
    }
    if let Some(task_run) = &config.state.task_run {
        scope = scope.with_discriminator(task_run.clone(), config.state.hash_task_run);
    }
    scope
}
