//! File-backed engine that replays recorded change records.
//!
//! Each non-empty line of the replay file is one record:
//!
//! ```json
//! {"key_schema": {...}, "key": {...}, "value_schema": {...}, "value": {...},
//!  "source_offset": {"snapshot": true}}
//! ```
//!
//! Payloads use the schema-aware JSON form read by
//! [`ConnectValue::from_json`]; a payload without a schema is decoded by its
//! own JSON kind. The engine tracks how many records were processed in the
//! offsets file as `{"position": n}` and resumes after that many records.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use cdcflow_types::connect::ConnectValue;
use cdcflow_types::Schema;

use crate::connector::{
    CdcEngine, ChangeConsumer, Connector, ConnectorProperties, EngineCompletion, EngineHandle,
    RawChangeRecord, RecordCommitter, PROP_OFFSET_FILE,
};

pub const PROP_PATH: &str = "replay.path";
pub const PROP_BATCH_SIZE: &str = "replay.batch.size";
pub const PROP_POLL_INTERVAL_MS: &str = "replay.poll.interval.ms";
pub const PROP_STOP_AT_END: &str = "replay.stop.at.end";

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Connector for `use: replay`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayConnector;

impl Connector for ReplayConnector {
    fn name(&self) -> &str {
        "replay"
    }

    fn create_engine(&self, props: ConnectorProperties) -> Result<Box<dyn CdcEngine>> {
        Ok(Box::new(ReplayEngine::from_properties(&props)?))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ReplayHandle {
    closed: AtomicBool,
}

impl EngineHandle for ReplayHandle {
    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Replay engine close requested");
        }
        Ok(())
    }
}

pub struct ReplayEngine {
    path: PathBuf,
    offsets_file: PathBuf,
    batch_size: usize,
    poll_interval: Duration,
    stop_at_end: bool,
    handle: Arc<ReplayHandle>,
}

impl ReplayEngine {
    /// # Errors
    ///
    /// Returns an error if a required property is missing or a property
    /// value is malformed.
    pub fn from_properties(props: &ConnectorProperties) -> Result<Self> {
        let path = props
            .get(PROP_PATH)
            .with_context(|| format!("Missing required property '{PROP_PATH}'"))?;
        let offsets_file = props
            .get(PROP_OFFSET_FILE)
            .with_context(|| format!("Missing required property '{PROP_OFFSET_FILE}'"))?;
        let batch_size = props.parse_or(PROP_BATCH_SIZE, DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            anyhow::bail!("Property '{PROP_BATCH_SIZE}' must be at least 1");
        }
        let poll_ms = props.parse_or(PROP_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS)?;

        Ok(Self {
            path: PathBuf::from(path),
            offsets_file: PathBuf::from(offsets_file),
            batch_size,
            poll_interval: Duration::from_millis(poll_ms),
            stop_at_end: props.parse_or(PROP_STOP_AT_END, false)?,
            handle: Arc::new(ReplayHandle::default()),
        })
    }

    fn closed(&self) -> bool {
        self.handle.closed.load(Ordering::Acquire)
    }

    fn replay(&self, consumer: &mut dyn ChangeConsumer) -> Result<String> {
        let start = read_position(&self.offsets_file)?;
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open replay file {}", self.path.display()))?;
        let mut lines = LineReader::new(BufReader::new(file));
        let mut committer = OffsetCommitter {
            offsets_file: self.offsets_file.clone(),
            position: start,
            flushed: start,
        };

        let mut skipped = 0u64;
        while skipped < start {
            if lines.next_record()?.is_none() {
                break;
            }
            skipped += 1;
        }
        tracing::debug!(position = start, path = %self.path.display(), "Replay started");

        loop {
            if self.closed() {
                return Ok("engine closed".to_string());
            }

            let mut batch = Vec::with_capacity(self.batch_size);
            while batch.len() < self.batch_size {
                match lines.next_record()? {
                    Some(line) => batch.push(decode_record(&line).with_context(|| {
                        format!("Invalid replay record at line {}", lines.line_number)
                    })?),
                    None => {
                        if self.stop_at_end {
                            if let Some(line) = lines.take_partial() {
                                batch.push(decode_record(&line)?);
                            }
                        }
                        break;
                    }
                }
            }

            if batch.is_empty() {
                if self.stop_at_end {
                    return Ok("end of replay file".to_string());
                }
                std::thread::sleep(self.poll_interval);
                continue;
            }

            tracing::debug!(records = batch.len(), "Replaying batch");
            consumer.handle_batch(batch, &mut committer)?;
        }
    }
}

impl CdcEngine for ReplayEngine {
    fn handle(&self) -> Arc<dyn EngineHandle> {
        Arc::clone(&self.handle) as Arc<dyn EngineHandle>
    }

    fn run(self: Box<Self>, consumer: &mut dyn ChangeConsumer) -> EngineCompletion {
        match self.replay(consumer) {
            Ok(message) => EngineCompletion::success(message),
            Err(error) => EngineCompletion::failure("replay failed", error),
        }
    }
}

// ---------------------------------------------------------------------------
// Offsets
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReplayOffsets {
    position: u64,
}

fn read_position(path: &Path) -> Result<u64> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let offsets: ReplayOffsets = serde_json::from_slice(&bytes)
                .with_context(|| format!("Corrupt offsets file {}", path.display()))?;
            Ok(offsets.position)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

struct OffsetCommitter {
    offsets_file: PathBuf,
    position: u64,
    flushed: u64,
}

impl RecordCommitter for OffsetCommitter {
    fn mark_processed(&mut self, _record: &RawChangeRecord) -> Result<()> {
        self.position += 1;
        Ok(())
    }

    fn mark_batch_finished(&mut self) -> Result<()> {
        if self.position == self.flushed {
            return Ok(());
        }
        let bytes = serde_json::to_vec(&ReplayOffsets {
            position: self.position,
        })?;
        let tmp = self.offsets_file.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.offsets_file)
            .with_context(|| format!("Failed to write {}", self.offsets_file.display()))?;
        self.flushed = self.position;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Reads non-empty lines; tolerates a partially written last line by
/// leaving it for the next attempt.
struct LineReader<R> {
    reader: R,
    pending: String,
    line_number: u64,
}

impl<R: BufRead> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            pending: String::new(),
            line_number: 0,
        }
    }

    fn next_record(&mut self) -> Result<Option<String>> {
        loop {
            let read = self.reader.read_line(&mut self.pending)?;
            if read == 0 || !self.pending.ends_with('\n') {
                return Ok(None);
            }
            self.line_number += 1;
            let line = std::mem::take(&mut self.pending);
            let line = line.trim();
            if !line.is_empty() {
                return Ok(Some(line.to_string()));
            }
        }
    }

    /// A final line without a trailing newline.
    fn take_partial(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.pending);
        let line = line.trim();
        (!line.is_empty()).then(|| line.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ReplayLine {
    key_schema: Option<Schema>,
    key: Option<serde_json::Value>,
    value_schema: Option<Schema>,
    value: Option<serde_json::Value>,
    #[serde(default)]
    source_offset: serde_json::Map<String, serde_json::Value>,
}

fn decode_record(line: &str) -> Result<RawChangeRecord> {
    let raw: ReplayLine = serde_json::from_str(line)?;
    Ok(RawChangeRecord {
        key: decode_payload(raw.key_schema.as_ref(), raw.key.as_ref())?,
        key_schema: raw.key_schema,
        value: decode_payload(raw.value_schema.as_ref(), raw.value.as_ref())?,
        value_schema: raw.value_schema,
        source_offset: raw.source_offset,
    })
}

fn decode_payload(
    schema: Option<&Schema>,
    json: Option<&serde_json::Value>,
) -> Result<Option<ConnectValue>> {
    Ok(match (schema, json) {
        (_, None) => None,
        (Some(schema), Some(json)) => ConnectValue::from_json(schema, json)?,
        (None, Some(json)) => schemaless(json),
    })
}

fn schemaless(json: &serde_json::Value) -> Option<ConnectValue> {
    use serde_json::Value as Json;
    Some(match json {
        Json::Null => return None,
        Json::Bool(b) => ConnectValue::Boolean(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => ConnectValue::Int64(i),
            None => ConnectValue::Float64(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => ConnectValue::String(s.clone()),
        Json::Array(items) => ConnectValue::Array(items.iter().map(schemaless).collect()),
        Json::Object(object) => ConnectValue::Map(
            object
                .iter()
                .map(|(k, v)| (ConnectValue::String(k.clone()), schemaless(v)))
                .collect(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CaptureError;
    use std::io::Cursor;

    struct Collect {
        batches: Vec<usize>,
        fail_after: Option<usize>,
    }

    impl ChangeConsumer for Collect {
        fn handle_batch(
            &mut self,
            records: Vec<RawChangeRecord>,
            committer: &mut dyn RecordCommitter,
        ) -> Result<(), CaptureError> {
            if self.fail_after == Some(self.batches.len()) {
                return Err(CaptureError::SubscriberClosed);
            }
            for record in &records {
                committer.mark_processed(record)?;
            }
            committer.mark_batch_finished()?;
            self.batches.push(records.len());
            Ok(())
        }
    }

    fn engine(dir: &Path, lines: &[&str], batch: usize) -> ReplayEngine {
        let path = dir.join("changes.jsonl");
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        let mut props = ConnectorProperties::new();
        props.set(PROP_PATH, path.display().to_string());
        props.set(PROP_OFFSET_FILE, dir.join("offsets.dat").display().to_string());
        props.set(PROP_BATCH_SIZE, batch.to_string());
        props.set(PROP_STOP_AT_END, "true");
        ReplayEngine::from_properties(&props).unwrap()
    }

    const LINE: &str = r#"{"value": {"a": 1}}"#;

    #[test]
    fn replays_in_batches_and_tracks_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut consumer = Collect {
            batches: vec![],
            fail_after: None,
        };
        let completion = Box::new(engine(dir.path(), &[LINE, LINE, "", LINE], 2)).run(&mut consumer);
        assert!(completion.success, "{completion:?}");
        assert_eq!(consumer.batches, vec![2, 1]);
        assert_eq!(read_position(&dir.path().join("offsets.dat")).unwrap(), 3);
    }

    #[test]
    fn resumes_after_recorded_position() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("offsets.dat"), br#"{"position":2}"#).unwrap();
        let mut consumer = Collect {
            batches: vec![],
            fail_after: None,
        };
        let completion = Box::new(engine(dir.path(), &[LINE, LINE, LINE], 10)).run(&mut consumer);
        assert!(completion.success);
        assert_eq!(consumer.batches, vec![1]);
    }

    #[test]
    fn consumer_failure_fails_the_run_without_advancing() {
        let dir = tempfile::tempdir().unwrap();
        let mut consumer = Collect {
            batches: vec![],
            fail_after: Some(1),
        };
        let completion = Box::new(engine(dir.path(), &[LINE, LINE, LINE], 2)).run(&mut consumer);
        assert!(!completion.success);
        assert!(matches!(
            completion.into_result(),
            Err(CaptureError::SubscriberClosed)
        ));
        assert_eq!(read_position(&dir.path().join("offsets.dat")).unwrap(), 2);
    }

    #[test]
    fn closed_engine_ends_successfully() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), &[LINE], 1);
        engine.handle().close().unwrap();
        let mut consumer = Collect {
            batches: vec![],
            fail_after: None,
        };
        let completion = Box::new(engine).run(&mut consumer);
        assert!(completion.success);
        assert!(consumer.batches.is_empty());
    }

    #[test]
    fn missing_path_is_rejected() {
        let err = ReplayEngine::from_properties(&ConnectorProperties::new())
            .err()
            .unwrap();
        assert!(err.to_string().contains(PROP_PATH));
    }

    #[test]
    fn schema_aware_and_schemaless_payloads_decode() {
        let record = decode_record(
            r#"{"key_schema": {"type": "int32"}, "key": 5, "value": {"n": 1.5, "tags": ["x"]},
                "source_offset": {"snapshot": true}}"#,
        )
        .unwrap();
        assert_eq!(record.key, Some(ConnectValue::Int32(5)));
        assert!(record.is_snapshot());
        let Some(ConnectValue::Map(entries)) = record.value else {
            panic!("expected map");
        };
        assert_eq!(entries[0].1, Some(ConnectValue::Float64(1.5)));
    }

    #[test]
    fn partial_last_line_is_left_for_later() {
        let mut reader = LineReader::new(Cursor::new(b"{\"a\":1}\n{\"b\"".to_vec()));
        assert_eq!(reader.next_record().unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(reader.next_record().unwrap(), None);
    }
}
