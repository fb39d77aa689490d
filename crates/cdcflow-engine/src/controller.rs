//! Lifecycle of one embedded engine run.
//!
//! ```text
//! Idle -> Restoring -> Running(Snapshotting | Streaming) -> Draining -> Terminated
//! ```
//!
//! The engine runs on a dedicated blocking thread and calls the batch
//! consumer synchronously. The controller task only polls termination
//! conditions, requests the close, waits for the thread, and performs the
//! final checkpoint write.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::task::JoinHandle;

use crate::checkpoint::{CheckpointContext, PersistedKeys};
use crate::config::types::{LimitsConfig, OffsetsCommitMode, SourceConfig};
use crate::connector::{
    base_properties, CdcEngine, ChangeConsumer, Connector, EngineCompletion, EngineHandle,
    RawChangeRecord, RecordCommitter,
};
use crate::errors::CaptureError;
use crate::normalize::convert_record;
use crate::router::RecordSink;
use crate::shape::RecordShaper;

// ---------------------------------------------------------------------------
// Run session
// ---------------------------------------------------------------------------

/// Progress shared between the engine thread and the controller task.
#[derive(Debug)]
pub struct RunSession {
    run_started_at: Instant,
    record_count: AtomicU64,
    in_snapshot_phase: AtomicBool,
    /// Milliseconds after `run_started_at` of the last accepted batch.
    last_record_ms: AtomicU64,
}

impl RunSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_started_at: Instant::now(),
            record_count: AtomicU64::new(0),
            in_snapshot_phase: AtomicBool::new(false),
            last_record_ms: AtomicU64::new(0),
        }
    }

    /// Records accepted into the output so far.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn in_snapshot_phase(&self) -> bool {
        self.in_snapshot_phase.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.run_started_at.elapsed()
    }

    /// Time since the last accepted batch, or since the run started.
    #[must_use]
    pub fn since_last_record(&self) -> Duration {
        let last = Duration::from_millis(self.last_record_ms.load(Ordering::Acquire));
        self.elapsed().saturating_sub(last)
    }

    fn record_batch(&self, accepted: u64, snapshot: Option<bool>) {
        if let Some(snapshot) = snapshot {
            self.in_snapshot_phase.store(snapshot, Ordering::Release);
        }
        // A batch the filters emptied is not activity for the idle timer.
        if accepted > 0 {
            let now = u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.last_record_ms.store(now, Ordering::Release);
        }
        self.record_count.fetch_add(accepted, Ordering::AcqRel);
    }
}

impl Default for RunSession {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Termination budgets and checkpoint policy for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub max_records: Option<u64>,
    pub max_duration: Option<Duration>,
    pub max_wait: Option<Duration>,
    pub max_snapshot_duration: Duration,
    pub poll_interval: Duration,
    pub drain_grace: Duration,
    pub commit_mode: OffsetsCommitMode,
}

impl RunSettings {
    #[must_use]
    pub fn new(limits: &LimitsConfig, commit_mode: OffsetsCommitMode) -> Self {
        Self {
            max_records: limits.max_records,
            max_duration: limits.max_duration,
            max_wait: limits.max_wait,
            max_snapshot_duration: limits.max_snapshot_duration,
            poll_interval: limits.poll_interval,
            drain_grace: limits.drain_grace,
            commit_mode,
        }
    }

    /// Whether the current evaluation window is over.
    fn window_ended(&self, session: &RunSession, window_started: Instant) -> bool {
        // Snapshot records never count against the record budget.
        if !session.in_snapshot_phase()
            && self
                .max_records
                .is_some_and(|max| session.record_count() >= max)
        {
            return true;
        }
        if self
            .max_duration
            .is_some_and(|max| window_started.elapsed() >= max)
        {
            return true;
        }
        self.max_wait
            .is_some_and(|max| session.since_last_record() >= max)
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::new(&LimitsConfig::default(), OffsetsCommitMode::default())
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Restoring,
    Snapshotting,
    Streaming,
    Draining,
    Succeeded,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Restoring => "restoring",
            Self::Snapshotting => "running(snapshotting)",
            Self::Streaming => "running(streaming)",
            Self::Draining => "draining",
            Self::Succeeded => "terminated(success)",
            Self::Failed => "terminated(failed)",
        })
    }
}

// ---------------------------------------------------------------------------
// Batch consumer
// ---------------------------------------------------------------------------

/// Normalizes, shapes and delivers each batch, then acknowledges it.
pub(crate) struct CaptureConsumer<S> {
    shaper: RecordShaper,
    sink: S,
    session: Arc<RunSession>,
    checkpoint: CheckpointContext,
    commit_mode: OffsetsCommitMode,
    persisted: PersistedKeys,
}

impl<S: RecordSink> CaptureConsumer<S> {
    pub(crate) fn new(
        shaper: RecordShaper,
        sink: S,
        session: Arc<RunSession>,
        checkpoint: CheckpointContext,
        commit_mode: OffsetsCommitMode,
    ) -> Self {
        Self {
            shaper,
            sink,
            session,
            checkpoint,
            commit_mode,
            persisted: PersistedKeys::default(),
        }
    }

    pub(crate) fn into_parts(self) -> (S, PersistedKeys) {
        (self.sink, self.persisted)
    }
}

impl<S: RecordSink> ChangeConsumer for CaptureConsumer<S> {
    fn handle_batch(
        &mut self,
        records: Vec<RawChangeRecord>,
        committer: &mut dyn RecordCommitter,
    ) -> Result<(), CaptureError> {
        let snapshot = records.last().map(RawChangeRecord::is_snapshot);
        let mut accepted = 0u64;

        for record in &records {
            let message = convert_record(record)?;
            if let Some(shaped) = self.shaper.shape(message) {
                self.sink.accept(&shaped.stream, shaped.record)?;
                accepted += 1;
            }
            committer.mark_processed(record)?;
        }
        committer.mark_batch_finished()?;
        self.session.record_batch(accepted, snapshot);

        if self.commit_mode == OffsetsCommitMode::OnEachBatch {
            self.persisted = self.checkpoint.persist()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

type EngineThread<S> = JoinHandle<(EngineCompletion, CaptureConsumer<S>)>;

/// Drives one engine run through its phases.
pub struct EngineController {
    settings: RunSettings,
    session: Arc<RunSession>,
    phase: RunPhase,
}

impl EngineController {
    #[must_use]
    pub fn new(settings: RunSettings) -> Self {
        Self {
            settings,
            session: Arc::new(RunSession::new()),
            phase: RunPhase::Idle,
        }
    }

    #[must_use]
    pub fn session(&self) -> Arc<RunSession> {
        Arc::clone(&self.session)
    }

    #[must_use]
    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn transition(&mut self, next: RunPhase) {
        if self.phase != next {
            tracing::debug!(from = %self.phase, to = %next, "Run phase changed");
            self.phase = next;
        }
    }

    fn observe_running(&mut self) {
        if self.session.in_snapshot_phase() {
            self.transition(RunPhase::Snapshotting);
        } else {
            self.transition(RunPhase::Streaming);
        }
    }

    /// Restore checkpoints and build the engine.
    ///
    /// User-supplied source properties are applied last.
    ///
    /// # Errors
    ///
    /// Returns an error if a stored checkpoint cannot be restored, the
    /// connector rejects the source settings, or the engine cannot be created.
    pub(crate) fn prepare(
        &mut self,
        connector: &dyn Connector,
        source: &SourceConfig,
        checkpoint: &CheckpointContext,
    ) -> Result<Box<dyn CdcEngine>, CaptureError> {
        self.transition(RunPhase::Restoring);
        checkpoint.restore()?;

        let offsets = checkpoint.offsets_path();
        let history = checkpoint.history_path();
        let mut props = base_properties(source, &offsets, history.as_deref());
        connector
            .configure(source, &mut props)
            .with_context(|| format!("Invalid settings for connector '{}'", connector.name()))?;
        for (key, value) in &source.properties {
            props.set(key.clone(), value.clone());
        }

        let engine = connector
            .create_engine(props)
            .with_context(|| format!("Failed to create '{}' engine", connector.name()))?;
        tracing::info!(connector = connector.name(), "Engine created");
        Ok(engine)
    }

    fn spawn<S: RecordSink + 'static>(
        &mut self,
        engine: Box<dyn CdcEngine>,
        mut consumer: CaptureConsumer<S>,
    ) -> EngineThread<S> {
        self.observe_running();
        tokio::task::spawn_blocking(move || {
            let completion = engine.run(&mut consumer);
            (completion, consumer)
        })
    }

    /// Run until a budget is exhausted, then drain.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure (no checkpoint is written), or a
    /// [`CaptureError::Engine`] if the engine did not stop within the drain
    /// grace period.
    pub(crate) async fn run_bounded<S: RecordSink + 'static>(
        &mut self,
        engine: Box<dyn CdcEngine>,
        consumer: CaptureConsumer<S>,
    ) -> Result<CaptureConsumer<S>, CaptureError> {
        let handle = engine.handle();
        let mut thread = self.spawn(engine, consumer);
        let snapshot_started_at = Instant::now();

        loop {
            let previous = self.session.record_count();
            let window_started = Instant::now();
            while !thread.is_finished()
                && !self.settings.window_ended(&self.session, window_started)
            {
                self.observe_running();
                tokio::time::sleep(self.settings.poll_interval).await;
            }

            let consumed = self.session.record_count() > previous;
            let extend = !thread.is_finished()
                && self.session.in_snapshot_phase()
                && consumed
                && snapshot_started_at.elapsed() < self.settings.max_snapshot_duration;
            if !extend {
                break;
            }
            tracing::debug!(
                records = self.session.record_count(),
                "Still snapshotting, extending capture window"
            );
        }

        self.drain(handle, thread).await
    }

    /// Run until the engine ends on its own, e.g. after an external close.
    ///
    /// # Errors
    ///
    /// Returns the engine's failure.
    pub(crate) async fn run_until_closed<S: RecordSink + 'static>(
        &mut self,
        engine: Box<dyn CdcEngine>,
        consumer: CaptureConsumer<S>,
    ) -> Result<CaptureConsumer<S>, CaptureError> {
        let thread = self.spawn(engine, consumer);
        let joined = thread.await;
        self.transition(RunPhase::Draining);
        self.complete(joined)
    }

    async fn drain<S>(
        &mut self,
        handle: Arc<dyn EngineHandle>,
        mut thread: EngineThread<S>,
    ) -> Result<CaptureConsumer<S>, CaptureError> {
        self.transition(RunPhase::Draining);
        if !thread.is_finished() {
            let closer = Arc::clone(&handle);
            let closed = tokio::task::spawn_blocking(move || closer.close()).await;
            match closed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Engine close request failed"),
                Err(e) => tracing::warn!(error = %e, "Engine close task panicked"),
            }
        }

        let grace = self.settings.drain_grace;
        if let Ok(joined) = tokio::time::timeout(grace, &mut thread).await {
            self.complete(joined)
        } else {
            self.transition(RunPhase::Failed);
            tracing::warn!(
                grace_secs = grace.as_secs_f64(),
                "Engine thread did not stop in time, abandoning it"
            );
            Err(CaptureError::Engine(format!(
                "engine did not stop within {}s",
                grace.as_secs()
            )))
        }
    }

    fn complete<S>(
        &mut self,
        joined: Result<(EngineCompletion, CaptureConsumer<S>), tokio::task::JoinError>,
    ) -> Result<CaptureConsumer<S>, CaptureError> {
        let outcome = match joined {
            Ok((completion, consumer)) => completion.into_result().map(|()| consumer),
            Err(e) => Err(CaptureError::Infrastructure(anyhow::anyhow!(
                "engine thread failed: {e}"
            ))),
        };
        self.transition(if outcome.is_ok() {
            RunPhase::Succeeded
        } else {
            RunPhase::Failed
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{Format, ShapeOptions};
    use cdcflow_state::{SqliteCheckpointStore, StateScope};
    use cdcflow_types::connect::ConnectValue;
    use cdcflow_types::Fields;

    #[derive(Default)]
    struct Collect(Vec<String>);

    impl RecordSink for Collect {
        fn accept(&mut self, stream: &str, _record: Fields) -> Result<(), CaptureError> {
            self.0.push(stream.to_string());
            Ok(())
        }
    }

    struct NoopCommitter;

    impl RecordCommitter for NoopCommitter {
        fn mark_processed(&mut self, _record: &RawChangeRecord) -> anyhow::Result<()> {
            Ok(())
        }

        fn mark_batch_finished(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CloseFlag(AtomicBool);

    impl EngineHandle for CloseFlag {
        fn close(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::Release);
            Ok(())
        }
    }

    /// Emits one snapshot record every few milliseconds until closed. With
    /// `linger` set it keeps going that long after the close request.
    struct EndlessSnapshot {
        flag: Arc<CloseFlag>,
        linger: Option<Duration>,
    }

    impl EndlessSnapshot {
        fn new(linger: Option<Duration>) -> Box<Self> {
            Box::new(Self {
                flag: Arc::default(),
                linger,
            })
        }
    }

    impl CdcEngine for EndlessSnapshot {
        fn handle(&self) -> Arc<dyn EngineHandle> {
            self.flag.clone()
        }

        fn run(self: Box<Self>, consumer: &mut dyn ChangeConsumer) -> EngineCompletion {
            let mut closed_at: Option<Instant> = None;
            loop {
                if self.flag.0.load(Ordering::Acquire) {
                    let since = *closed_at.get_or_insert_with(Instant::now);
                    if self.linger.map_or(true, |linger| since.elapsed() >= linger) {
                        return EngineCompletion::success("closed");
                    }
                }
                if let Err(e) = consumer.handle_batch(vec![snapshot_record()], &mut NoopCommitter) {
                    return EngineCompletion::failure("consumer failed", e.into());
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }

    fn snapshot_record() -> RawChangeRecord {
        RawChangeRecord {
            value: Some(ConnectValue::Int64(1)),
            source_offset: serde_json::Map::from_iter([(
                "snapshot".to_string(),
                serde_json::Value::Bool(true),
            )]),
            ..RawChangeRecord::default()
        }
    }

    fn consumer(options: ShapeOptions, session: Arc<RunSession>) -> CaptureConsumer<Collect> {
        let store = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let dir = std::env::temp_dir();
        CaptureConsumer::new(
            RecordShaper::new(options),
            Collect::default(),
            session,
            CheckpointContext::new(store, StateScope::new("test"), dir, false),
            OffsetsCommitMode::OnStop,
        )
    }

    fn raw_options() -> ShapeOptions {
        ShapeOptions {
            format: Format::Raw,
            ignore_ddl: false,
            ..ShapeOptions::default()
        }
    }

    fn bounded(max_snapshot: Duration, drain_grace: Duration) -> RunSettings {
        RunSettings {
            max_records: Some(1),
            max_duration: Some(Duration::from_millis(20)),
            max_wait: None,
            max_snapshot_duration: max_snapshot,
            poll_interval: Duration::from_millis(5),
            drain_grace,
            commit_mode: OffsetsCommitMode::OnStop,
        }
    }

    #[tokio::test]
    async fn endless_snapshot_is_stopped_at_the_snapshot_ceiling() {
        let ceiling = Duration::from_millis(150);
        let mut controller = EngineController::new(bounded(ceiling, Duration::from_secs(5)));
        let session = controller.session();
        let started = Instant::now();

        let consumer = controller
            .run_bounded(EndlessSnapshot::new(None), consumer(raw_options(), session.clone()))
            .await
            .unwrap();

        assert!(started.elapsed() >= ceiling);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(controller.phase(), RunPhase::Succeeded);
        assert!(session.in_snapshot_phase());
        let (sink, _) = consumer.into_parts();
        assert_eq!(sink.0.len() as u64, session.record_count());
        assert!(sink.0.iter().all(|stream| stream == "data"));
    }

    #[tokio::test]
    async fn engine_ignoring_close_fails_after_drain_grace() {
        let settings = bounded(Duration::ZERO, Duration::from_millis(50));
        let mut controller = EngineController::new(settings);
        let session = controller.session();
        let engine = EndlessSnapshot::new(Some(Duration::from_millis(400)));

        let err = controller
            .run_bounded(engine, consumer(raw_options(), session))
            .await
            .err()
            .unwrap();

        assert!(matches!(&err, CaptureError::Engine(message) if message.contains("did not stop within")));
        assert!(!err.is_retryable());
        assert_eq!(controller.phase(), RunPhase::Failed);
    }

    #[test]
    fn filtered_batches_do_not_reset_the_idle_clock() {
        let session = Arc::new(RunSession::new());
        // Non-envelope values are dropped while DDL is ignored.
        let mut consumer = consumer(ShapeOptions::default(), session.clone());
        let mut streaming = snapshot_record();
        streaming.source_offset.clear();

        std::thread::sleep(Duration::from_millis(30));
        consumer
            .handle_batch(vec![streaming], &mut NoopCommitter)
            .unwrap();

        assert_eq!(session.record_count(), 0);
        assert!(session.since_last_record() >= Duration::from_millis(30));
        let wait = RunSettings {
            max_records: None,
            max_wait: Some(Duration::from_millis(25)),
            ..RunSettings::default()
        };
        assert!(wait.window_ended(&session, Instant::now()));
    }

    #[test]
    fn accepted_batches_reset_the_idle_clock() {
        let session = Arc::new(RunSession::new());
        let mut consumer = consumer(raw_options(), session.clone());
        std::thread::sleep(Duration::from_millis(30));
        consumer
            .handle_batch(vec![snapshot_record()], &mut NoopCommitter)
            .unwrap();
        assert_eq!(session.record_count(), 1);
        assert!(session.since_last_record() < Duration::from_millis(30));
    }

    fn settings() -> RunSettings {
        RunSettings {
            max_records: Some(10),
            max_duration: None,
            max_wait: None,
            ..RunSettings::default()
        }
    }

    #[test]
    fn record_budget_is_ignored_while_snapshotting() {
        let session = RunSession::new();
        session.record_batch(25, Some(true));
        assert!(!settings().window_ended(&session, Instant::now()));

        session.record_batch(0, Some(false));
        assert!(settings().window_ended(&session, Instant::now()));
    }

    #[test]
    fn empty_batches_keep_snapshot_flag_and_idle_clock() {
        let session = RunSession::new();
        session.record_batch(1, Some(true));
        session.record_batch(0, None);
        assert!(session.in_snapshot_phase());
        assert_eq!(session.record_count(), 1);
    }

    #[test]
    fn zero_durations_end_the_window_immediately() {
        let session = RunSession::new();
        let wait = RunSettings {
            max_records: None,
            max_wait: Some(Duration::ZERO),
            ..RunSettings::default()
        };
        assert!(wait.window_ended(&session, Instant::now()));

        let duration = RunSettings {
            max_records: None,
            max_wait: None,
            max_duration: Some(Duration::ZERO),
            ..RunSettings::default()
        };
        assert!(duration.window_ended(&session, Instant::now()));
    }

    #[test]
    fn unbounded_settings_never_end() {
        let session = RunSession::new();
        let unbounded = RunSettings {
            max_records: None,
            max_wait: None,
            max_duration: None,
            ..RunSettings::default()
        };
        assert!(!unbounded.window_ended(&session, Instant::now()));
    }

    #[test]
    fn settings_follow_limits() {
        let limits = LimitsConfig {
            max_records: Some(3),
            ..LimitsConfig::default()
        };
        let settings = RunSettings::new(&limits, OffsetsCommitMode::OnStop);
        assert_eq!(settings.max_records, Some(3));
        assert_eq!(settings.max_wait, Some(Duration::from_secs(10)));
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.commit_mode, OffsetsCommitMode::OnStop);
    }

    #[test]
    fn phases_render_with_running_substate() {
        assert_eq!(RunPhase::Snapshotting.to_string(), "running(snapshotting)");
        assert_eq!(RunPhase::Failed.to_string(), "terminated(failed)");
    }
}
