//! Per-stream output buffering and final hand-off to storage.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cdcflow_types::Fields;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

use crate::errors::CaptureError;
use crate::result::Counter;

const PROGRESS_EVERY: u64 = 5000;

/// Receives shaped records on the engine thread.
pub trait RecordSink: Send {
    /// # Errors
    ///
    /// Returns a [`CaptureError`] if the record cannot be delivered.
    fn accept(&mut self, stream: &str, record: Fields) -> Result<(), CaptureError>;
}

/// Persists finalized stream files.
pub trait OutputStorage: Send + Sync {
    /// Store the file at `path` as the output of `stream`; returns its URI.
    ///
    /// # Errors
    ///
    /// Returns an error if the file could not be stored.
    fn put_file(&self, stream: &str, path: &Path) -> Result<String>;
}

/// Copies stream files into a local directory.
///
/// Each stored file gets a fresh `<stream>-<random>.jsonl` name, so runs
/// sharing a directory never overwrite each other's output.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    directory: PathBuf,
}

impl LocalStorage {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

impl OutputStorage for LocalStorage {
    fn put_file(&self, stream: &str, path: &Path) -> Result<String> {
        fs::create_dir_all(&self.directory).with_context(|| {
            format!("Failed to create output directory {}", self.directory.display())
        })?;
        let mut target = tempfile::Builder::new()
            .prefix(&format!("{}-", sanitize(stream)))
            .suffix(".jsonl")
            .tempfile_in(&self.directory)
            .with_context(|| format!("Failed to create output file for stream '{stream}'"))?;
        let mut source = fs::File::open(path)
            .with_context(|| format!("Failed to open stream file {}", path.display()))?;
        std::io::copy(&mut source, &mut target)
            .with_context(|| format!("Failed to copy stream '{stream}'"))?;
        let (_, target) = target
            .keep()
            .with_context(|| format!("Failed to keep output file for stream '{stream}'"))?;
        tracing::debug!(stream, path = %target.display(), "Stored stream file");
        let absolute = fs::canonicalize(&target).unwrap_or(target);
        Ok(format!("file://{}", absolute.display()))
    }
}

struct StreamFile {
    writer: BufWriter<NamedTempFile>,
    records: u64,
}

/// One newline-delimited JSON temp file per output stream.
///
/// Files are created lazily in the working directory on the first record
/// for a stream and removed once [`StreamRouter::finalize`] hands them to
/// storage (or when the router is dropped).
pub struct StreamRouter {
    work_dir: PathBuf,
    streams: BTreeMap<String, StreamFile>,
    total: u64,
}

impl StreamRouter {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            streams: BTreeMap::new(),
            total: 0,
        }
    }

    /// Records accepted across all streams.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn counters(&self) -> Vec<Counter> {
        self.streams
            .iter()
            .map(|(stream, file)| Counter::records(stream, file.records))
            .collect()
    }

    fn open(&self, stream: &str) -> std::io::Result<StreamFile> {
        let file = tempfile::Builder::new()
            .prefix(&format!("{}-", sanitize(stream)))
            .suffix(".jsonl")
            .tempfile_in(&self.work_dir)?;
        tracing::debug!(stream, path = %file.path().display(), "Opened stream file");
        Ok(StreamFile {
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    /// Flush every stream and store it; returns stream -> URI.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be flushed or stored.
    pub fn finalize(self, storage: &dyn OutputStorage) -> Result<BTreeMap<String, String>> {
        let mut uris = BTreeMap::new();
        for (stream, file) in self.streams {
            let temp = file
                .writer
                .into_inner()
                .map_err(std::io::IntoInnerError::into_error)
                .with_context(|| format!("Failed to flush stream '{stream}'"))?;
            let uri = storage.put_file(&stream, temp.path())?;
            tracing::info!(stream = %stream, records = file.records, uri = %uri, "Stream finalized");
            uris.insert(stream, uri);
        }
        Ok(uris)
    }
}

impl RecordSink for StreamRouter {
    fn accept(&mut self, stream: &str, record: Fields) -> Result<(), CaptureError> {
        if !self.streams.contains_key(stream) {
            let file = self.open(stream)?;
            self.streams.insert(stream.to_string(), file);
        }
        let Some(file) = self.streams.get_mut(stream) else {
            return Ok(());
        };
        serde_json::to_writer(&mut file.writer, &record).map_err(std::io::Error::from)?;
        file.writer.write_all(b"\n")?;
        file.records += 1;

        self.total += 1;
        if self.total % PROGRESS_EVERY == 0 {
            tracing::debug!(records = self.total, "Accepted records");
        }
        Ok(())
    }
}

/// File-name stem for a stream: path separators and other specials become
/// `-`, and leading dots are dropped.
fn sanitize(stream: &str) -> String {
    let safe: String = stream
        .trim_start_matches('.')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '-' })
        .collect();
    if safe.is_empty() {
        "stream".to_string()
    } else {
        safe
    }
}

/// One shaped record emitted to a realtime subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamOutput {
    pub stream: String,
    pub data: Fields,
}

/// Forwards shaped records to an async subscriber.
///
/// Blocks the engine thread while the channel is full, which applies
/// backpressure to the engine.
pub struct ChannelSink {
    tx: mpsc::Sender<StreamOutput>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: mpsc::Sender<StreamOutput>) -> Self {
        Self { tx }
    }
}

impl RecordSink for ChannelSink {
    fn accept(&mut self, stream: &str, record: Fields) -> Result<(), CaptureError> {
        self.tx
            .blocking_send(StreamOutput {
                stream: stream.to_string(),
                data: record,
            })
            .map_err(|_| CaptureError::SubscriberClosed)
    }
}
