pub mod capture;
pub mod stream;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use cdcflow_engine::config::parser;
use cdcflow_engine::config::types::CaptureConfig;
use cdcflow_engine::config::validator;
use cdcflow_engine::connector::Connector;
use cdcflow_engine::resolve;
use cdcflow_state::CheckpointStore;

/// Parsed and validated capture with its connector and checkpoint store.
pub struct Prepared {
    pub config: CaptureConfig,
    pub connector: Arc<dyn Connector>,
    pub store: Arc<dyn CheckpointStore>,
}

/// Parse, validate, and resolve everything a capture needs.
pub fn prepare(capture_path: &Path) -> Result<Prepared> {
    // 1. Parse capture YAML
    let config = parser::parse_capture(capture_path)
        .with_context(|| format!("Failed to parse capture: {}", capture_path.display()))?;

    // 2. Validate
    validator::validate_capture(&config)?;

    // 3. Resolve connector and state
    let connector = resolve::resolve_connector(&config.source.use_ref)?;
    let store = resolve::create_checkpoint_store(&config.state)?;

    tracing::info!(
        flow = config.flow.as_deref().unwrap_or("-"),
        source = %config.source.use_ref,
        state_name = %config.state.name,
        "Capture validated"
    );

    Ok(Prepared {
        config,
        connector,
        store,
    })
}
