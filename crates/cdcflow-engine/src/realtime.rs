//! Unbounded realtime streaming with one-shot cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::{Duration, Instant};

use cdcflow_state::CheckpointStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::checkpoint::CheckpointContext;
use crate::config::types::{CaptureConfig, OffsetsCommitMode};
use crate::connector::{Connector, EngineHandle};
use crate::controller::{CaptureConsumer, EngineController, RunSettings};
use crate::errors::CaptureError;
use crate::resolve::state_scope;
use crate::result::StreamSummary;
use crate::router::{ChannelSink, StreamOutput};
use crate::shape::RecordShaper;

/// How long [`RealtimeHandle::kill`] waits for the engine to close.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(60);

/// Stops a running stream. Only the first stop or kill has any effect.
pub struct RealtimeHandle {
    active: AtomicBool,
    engine: Arc<dyn EngineHandle>,
}

impl RealtimeHandle {
    fn new(engine: Arc<dyn EngineHandle>) -> Self {
        Self {
            active: AtomicBool::new(true),
            engine,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Request a graceful stop without waiting for it.
    pub fn stop(&self) {
        self.stop_with(false);
    }

    /// Stop and block until the engine has closed, for up to
    /// [`KILL_TIMEOUT`].
    pub fn kill(&self) {
        self.stop_with(true);
    }

    fn stop_with(&self, wait: bool) {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let engine = Arc::clone(&self.engine);
        let (done_tx, done_rx) = std_mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("cdcflow-engine-close".into())
            .spawn(move || {
                if let Err(e) = engine.close() {
                    tracing::warn!(error = %e, "Engine close failed");
                }
                let _ = done_tx.send(());
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "Unable to spawn engine close thread");
            return;
        }

        if wait && done_rx.recv_timeout(KILL_TIMEOUT).is_err() {
            tracing::warn!(
                timeout_secs = KILL_TIMEOUT.as_secs(),
                "Engine did not close in time"
            );
        }
    }
}

/// A running realtime stream.
///
/// Receive until [`RealtimeStream::recv`] returns `None`, then call
/// [`RealtimeStream::finish`] for the run's outcome.
pub struct RealtimeStream {
    records: mpsc::Receiver<StreamOutput>,
    handle: Arc<RealtimeHandle>,
    task: JoinHandle<Result<StreamSummary, CaptureError>>,
}

impl RealtimeStream {
    #[must_use]
    pub fn handle(&self) -> Arc<RealtimeHandle> {
        Arc::clone(&self.handle)
    }

    /// Next shaped record; `None` once the engine has stopped.
    pub async fn recv(&mut self) -> Option<StreamOutput> {
        self.records.recv().await
    }

    /// Wait for the run to end.
    ///
    /// Records the subscriber has not received yet are handed back in
    /// [`StreamSummary::undelivered`]; with `ON_EACH_BATCH` their offsets may
    /// already be committed.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure or a checkpoint write failure. Buffered
    /// records are dropped in that case and their count is logged.
    pub async fn finish(mut self) -> Result<StreamSummary, CaptureError> {
        let mut undelivered = Vec::new();
        while let Some(record) = self.records.recv().await {
            undelivered.push(record);
        }
        let outcome = self.task.await.map_err(|e| {
            CaptureError::Infrastructure(anyhow::anyhow!("stream task failed: {e}"))
        })?;
        match outcome {
            Ok(mut summary) => {
                if !undelivered.is_empty() {
                    tracing::info!(
                        undelivered = undelivered.len(),
                        "Returning records not received before finish"
                    );
                }
                summary.undelivered = undelivered;
                Ok(summary)
            }
            Err(e) => {
                if !undelivered.is_empty() {
                    tracing::warn!(
                        discarded = undelivered.len(),
                        "Discarded records buffered by a failed stream"
                    );
                }
                Err(e)
            }
        }
    }
}

/// Start streaming. Must be called from within a Tokio runtime.
///
/// With `ON_EACH_BATCH` checkpoints are persisted after every batch; with
/// `ON_STOP` only once the engine has stopped cleanly, so a process that
/// dies without a graceful stop re-emits records on restart.
///
/// # Errors
///
/// Returns an error if the working directory or engine cannot be created.
pub fn start_stream(
    config: &CaptureConfig,
    connector: &dyn Connector,
    store: Arc<dyn CheckpointStore>,
    buffer: usize,
) -> Result<RealtimeStream, CaptureError> {
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

    let engine = controller.prepare(connector, &config.source, &checkpoint)?;
    let handle = Arc::new(RealtimeHandle::new(engine.handle()));
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let consumer = CaptureConsumer::new(
        RecordShaper::new(config.output.shape.clone()),
        ChannelSink::new(tx),
        controller.session(),
        checkpoint.clone(),
        commit_mode,
    );
    tracing::info!(connector = connector.name(), ?commit_mode, "Stream started");

    let task = tokio::spawn(async move {
        let _work_dir = work_dir;
        let session = controller.session();
        let consumer = controller.run_until_closed(engine, consumer).await?;
        let (sink, mut keys) = consumer.into_parts();
        drop(sink);
        if commit_mode == OffsetsCommitMode::OnStop {
            keys = checkpoint.persist()?;
        }
        let summary = StreamSummary {
            emitted: session.record_count(),
            state_offset_key: keys.offsets,
            state_history_key: keys.history,
            duration_secs: started.elapsed().as_secs_f64(),
            undelivered: Vec::new(),
        };
        tracing::info!(records = summary.emitted, "Stream ended");
        Ok::<_, CaptureError>(summary)
    });

    Ok(RealtimeStream {
        records: rx,
        handle,
        task,
    })
}
