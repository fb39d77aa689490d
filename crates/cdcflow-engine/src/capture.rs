//! Bounded batch capture: run until a budget is exhausted, then persist.

use std::sync::Arc;
use std::time::Instant;

use cdcflow_state::CheckpointStore;

use crate::checkpoint::CheckpointContext;
use crate::config::types::CaptureConfig;
use crate::connector::Connector;
use crate::controller::{CaptureConsumer, EngineController, RunSettings};
use crate::errors::CaptureError;
use crate::resolve::state_scope;
use crate::result::CaptureOutput;
use crate::router::{OutputStorage, StreamRouter};
use crate::shape::RecordShaper;

/// Run one bounded capture.
///
/// Checkpoints are always persisted once the engine has stopped cleanly,
/// whatever the commit mode. A failed run persists nothing beyond what
/// earlier batches already committed.
///
/// # Errors
///
/// Returns the engine's failure, a checkpoint write failure, or an output
/// storage failure.
pub async fn run_capture(
    config: &CaptureConfig,
    connector: &dyn Connector,
    store: Arc<dyn CheckpointStore>,
    storage: &dyn OutputStorage,
) -> Result<CaptureOutput, CaptureError> {
    let started = Instant::now();
    let work_dir = tempfile::Builder::new().prefix("cdcflow-").tempdir()?;
    let checkpoint = CheckpointContext::new(
        store,
        state_scope(config),
        work_dir.path(),
        connector.needs_schema_history(),
    );
    let commit_mode = config.state.offsets_commit_mode;
    let mut controller = EngineController::new(RunSettings::new(&config.limits, commit_mode));

    tracing::info!(
        connector = connector.name(),
        state_name = %config.state.name,
        "Starting capture"
    );
    let engine = controller.prepare(connector, &config.source, &checkpoint)?;
    let consumer = CaptureConsumer::new(
        RecordShaper::new(config.output.shape.clone()),
        StreamRouter::new(work_dir.path()),
        controller.session(),
        checkpoint.clone(),
        commit_mode,
    );

    let consumer = controller.run_bounded(engine, consumer).await?;
    let (router, _) = consumer.into_parts();
    let keys = checkpoint.persist()?;

    let metrics = router.counters();
    let size = controller.session().record_count();
    let uris = router.finalize(storage)?;

    tracing::info!(
        records = size,
        streams = uris.len(),
        duration_secs = started.elapsed().as_secs_f64(),
        "Capture ended"
    );

    Ok(CaptureOutput {
        uris,
        size,
        state_offset_key: keys.offsets,
        state_history_key: keys.history,
        metrics,
        duration_secs: started.elapsed().as_secs_f64(),
    })
}
