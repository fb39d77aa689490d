//! Seams to the embedded CDC engine and its connectors.
//!
//! The engine itself is a black box: it is configured with string
//! properties, runs on a dedicated blocking thread, hands batches of
//! [`RawChangeRecord`]s to a [`ChangeConsumer`], and reports how it ended
//! through an [`EngineCompletion`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use cdcflow_types::connect::ConnectValue;
use cdcflow_types::Schema;

use crate::config::types::{OneOrMany, SourceConfig};
use crate::errors::CaptureError;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One engine-native change record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawChangeRecord {
    pub key_schema: Option<Schema>,
    pub key: Option<ConnectValue>,
    pub value_schema: Option<Schema>,
    pub value: Option<ConnectValue>,
    pub source_offset: serde_json::Map<String, serde_json::Value>,
}

impl RawChangeRecord {
    /// Whether the record was produced by the initial snapshot.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.source_offset.get("snapshot") == Some(&serde_json::Value::Bool(true))
    }
}

// ---------------------------------------------------------------------------
// Engine traits
// ---------------------------------------------------------------------------

/// Acknowledges consumed records back to the engine.
pub trait RecordCommitter {
    /// # Errors
    ///
    /// Returns an error if the engine rejects the acknowledgement.
    fn mark_processed(&mut self, record: &RawChangeRecord) -> Result<()>;

    /// Flush acknowledgements for the batch; engines persist offsets here.
    ///
    /// # Errors
    ///
    /// Returns an error if offsets could not be flushed.
    fn mark_batch_finished(&mut self) -> Result<()>;
}

/// Receives batches on the engine thread.
pub trait ChangeConsumer: Send {
    /// Handle one batch. An error fails the engine run.
    ///
    /// # Errors
    ///
    /// Returns a [`CaptureError`] if a record cannot be converted or
    /// delivered, or if a checkpoint write fails.
    fn handle_batch(
        &mut self,
        records: Vec<RawChangeRecord>,
        committer: &mut dyn RecordCommitter,
    ) -> Result<(), CaptureError>;
}

/// Control handle to a running engine, usable from any thread.
pub trait EngineHandle: Send + Sync {
    /// Ask the engine to stop. Idempotent; may block until the engine
    /// acknowledges.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine could not be signalled.
    fn close(&self) -> Result<()>;
}

/// How an engine run ended.
#[derive(Debug)]
pub struct EngineCompletion {
    pub success: bool,
    pub message: String,
    pub error: Option<anyhow::Error>,
}

impl EngineCompletion {
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error),
        }
    }

    /// Log the outcome and turn it into a result.
    ///
    /// A consumer error is handed back as the original [`CaptureError`];
    /// any other failure becomes [`CaptureError::Engine`].
    ///
    /// # Errors
    ///
    /// Returns the engine's error when the run did not succeed.
    pub fn into_result(self) -> Result<(), CaptureError> {
        if self.success {
            tracing::info!(message = %self.message, "Engine ended successfully");
        } else {
            tracing::warn!(message = %self.message, "Engine failed");
        }
        match self.error {
            None if self.success => Ok(()),
            None => Err(CaptureError::Engine(self.message)),
            Some(error) => match error.downcast::<CaptureError>() {
                Ok(capture) => Err(capture),
                Err(other) => Err(CaptureError::Engine(format!("{other:#}"))),
            },
        }
    }
}

/// An embedded CDC engine instance, ready to run once.
pub trait CdcEngine: Send {
    fn handle(&self) -> Arc<dyn EngineHandle>;

    /// Run until closed, finished, or failed. Blocks the calling thread.
    fn run(self: Box<Self>, consumer: &mut dyn ChangeConsumer) -> EngineCompletion;
}

/// Builds engines for one kind of source.
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the connector keeps a schema history file.
    fn needs_schema_history(&self) -> bool {
        false
    }

    /// Add connector-specific properties on top of the base set.
    ///
    /// # Errors
    ///
    /// Returns an error if the source settings are unusable.
    fn configure(&self, _source: &SourceConfig, _props: &mut ConnectorProperties) -> Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the engine cannot be created from `props`.
    fn create_engine(&self, props: ConnectorProperties) -> Result<Box<dyn CdcEngine>>;
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

pub const PROP_OFFSET_FILE: &str = "offset.storage.file.filename";
pub const PROP_HISTORY_FILE: &str = "schema.history.internal.file.filename";

/// Flat string properties handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectorProperties(BTreeMap<String, String>);

impl ConnectorProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Parse a property, falling back to `default` when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the property is present but unparseable.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid value '{raw}' for property '{key}': {e}")),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Properties every connector starts from.
///
/// User-supplied `source.properties` are applied by the caller last, after
/// [`Connector::configure`].
#[must_use]
pub fn base_properties(
    source: &SourceConfig,
    offsets_file: &Path,
    history_file: Option<&Path>,
) -> ConnectorProperties {
    let mut props = ConnectorProperties::new();
    props.set("name", "engine");

    props.set(
        "offset.storage",
        "org.apache.kafka.connect.storage.FileOffsetBackingStore",
    );
    props.set(PROP_OFFSET_FILE, offsets_file.display().to_string());
    props.set("offset.flush.interval.ms", "1000");

    if let Some(history) = history_file {
        props.set(
            "schema.history.internal",
            "io.debezium.storage.file.history.FileSchemaHistory",
        );
        props.set(PROP_HISTORY_FILE, history.display().to_string());
    }

    for (key, value) in [
        ("database.hostname", &source.hostname),
        ("database.port", &source.port),
        ("database.user", &source.username),
        ("database.password", &source.password),
    ] {
        if let Some(value) = value {
            props.set(key, value.clone());
        }
    }

    props.set("key.converter.schemas.enable", "false");
    props.set("value.converter.schemas.enable", "false");
    // Deletes carry the full row; no Kafka-style tombstone follow-ups.
    props.set("tombstones.on.delete", "false");
    props.set("topic.prefix", source.topic_prefix.clone());

    for (key, list) in [
        ("database.include.list", &source.include_databases),
        ("database.exclude.list", &source.exclude_databases),
        ("table.include.list", &source.include_tables),
        ("table.exclude.list", &source.exclude_tables),
        ("column.include.list", &source.include_columns),
        ("column.exclude.list", &source.exclude_columns),
    ] {
        if let Some(list) = list {
            props.set(key, join_list(list));
        }
    }

    props
}

/// Join list entries with `,`, escaping commas inside entries as `\,`.
#[must_use]
pub fn join_list(list: &OneOrMany) -> String {
    list.as_slice()
        .iter()
        .map(|entry| entry.replace(',', "\\,"))
        .collect::<Vec<_>>()
        .join(",")
}
