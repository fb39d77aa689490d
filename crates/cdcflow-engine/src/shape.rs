//! Record filtering, output shape, and stream routing names.
//!
//! [`RecordShaper`] turns one normalized [`ChangeMessage`] into at most one
//! flat output record plus the name of the stream it belongs to.

use serde::{Deserialize, Serialize};

use cdcflow_types::{ChangeMessage, Envelope, Fields, Payload, Source, Value};

/// Stream used when routing is off.
pub const DEFAULT_STREAM: &str = "data";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Output record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Format {
    /// `{key, value}` exactly as normalized.
    Raw,
    /// Row columns at the top level.
    #[default]
    Inline,
    /// Row columns under `record`.
    Wrap,
}

/// Handling of deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletedMode {
    /// Add a boolean column flagging deletes and truncates.
    #[default]
    AddField,
    /// Keep records as-is, no flag.
    Null,
    /// Drop tombstones.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyMode {
    #[default]
    AddField,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataMode {
    #[default]
    AddField,
    Drop,
}

/// Granularity of output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitTable {
    /// Everything goes to `data`.
    Off,
    /// One stream per database.
    Database,
    /// One stream per `db.table`.
    #[default]
    Table,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeOptions {
    pub format: Format,
    pub deleted: DeletedMode,
    pub deleted_field_name: String,
    pub key: KeyMode,
    pub metadata: MetadataMode,
    pub metadata_field_name: String,
    pub split_table: SplitTable,
    /// Drop every value that is not a row-change envelope.
    pub ignore_ddl: bool,
}

impl Default for ShapeOptions {
    fn default() -> Self {
        Self {
            format: Format::default(),
            deleted: DeletedMode::default(),
            deleted_field_name: "deleted".to_string(),
            key: KeyMode::default(),
            metadata: MetadataMode::default(),
            metadata_field_name: "metadata".to_string(),
            split_table: SplitTable::default(),
            ignore_ddl: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Shaper
// ---------------------------------------------------------------------------

/// A record ready for its output stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShapedRecord {
    pub stream: String,
    pub record: Fields,
}

#[derive(Debug, Clone, Default)]
pub struct RecordShaper {
    options: ShapeOptions,
}

impl RecordShaper {
    #[must_use]
    pub fn new(options: ShapeOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn options(&self) -> &ShapeOptions {
        &self.options
    }

    /// Shape one message. Returns `None` when the message is filtered out
    /// or has no routing target.
    #[must_use]
    pub fn shape(&self, message: ChangeMessage) -> Option<ShapedRecord> {
        if self.is_filtered(&message) {
            return None;
        }
        let Some(stream) = self.stream_name(message.value.as_ref().and_then(Payload::source))
        else {
            tracing::debug!(
                split_table = ?self.options.split_table,
                "Dropping record without routing coordinates"
            );
            return None;
        };

        let ChangeMessage { key, value } = message;
        let record = match (self.options.format, value) {
            (Format::Raw, value) => {
                let envelope_op = value
                    .as_ref()
                    .and_then(Payload::as_envelope)
                    .map(|e| e.operation);
                let mut record = Fields::with_capacity(3);
                record.insert("key", Value::from(key));
                record.insert("value", value.map_or(Value::Null, Value::from));
                if let Some(operation) = envelope_op {
                    self.add_deleted(&mut record, operation);
                }
                record
            }
            (Format::Inline, Some(Payload::Envelope(envelope))) => {
                let mut record = flatten(&envelope);
                self.decorate(&mut record, key, &envelope);
                record
            }
            (Format::Wrap, Some(Payload::Envelope(envelope))) => {
                let mut record = Fields::new();
                record.insert("record", flatten(&envelope));
                self.decorate(&mut record, key, &envelope);
                record
            }
            // Non-envelopes only survive filtering in RAW.
            (Format::Inline | Format::Wrap, _) => return None,
        };

        Some(ShapedRecord { stream, record })
    }

    fn is_filtered(&self, message: &ChangeMessage) -> bool {
        let is_envelope = message.envelope().is_some();
        if !is_envelope && self.options.ignore_ddl {
            return true;
        }
        if message.value.is_none() && self.options.deleted == DeletedMode::Drop {
            return true;
        }
        !is_envelope && self.options.format != Format::Raw
    }

    /// Output stream for a record from `source`, if it can be routed.
    #[must_use]
    pub fn stream_name(&self, source: Option<&Source>) -> Option<String> {
        match self.options.split_table {
            SplitTable::Off => Some(DEFAULT_STREAM.to_string()),
            SplitTable::Database => source.and_then(|s| s.db.clone()),
            SplitTable::Table => {
                let source = source?;
                Some(format!("{}.{}", source.db.as_deref()?, source.table.as_deref()?))
            }
        }
    }

    fn decorate(&self, record: &mut Fields, key: Option<Value>, envelope: &Envelope) {
        self.add_deleted(record, envelope.operation);
        if self.options.key == KeyMode::AddField {
            match key {
                Some(Value::Map(key)) => record.merge(key),
                None | Some(Value::Null) => {}
                Some(other) => {
                    record.insert("key", other);
                }
            }
        }
        if self.options.metadata == MetadataMode::AddField {
            record.insert(self.options.metadata_field_name.clone(), metadata(envelope));
        }
    }

    fn add_deleted(&self, record: &mut Fields, operation: Option<cdcflow_types::Operation>) {
        if self.options.deleted == DeletedMode::AddField {
            record.insert(
                self.options.deleted_field_name.clone(),
                operation.is_some_and(cdcflow_types::Operation::is_removal),
            );
        }
    }
}

/// Row columns of the change: `before` for deletes, `after` otherwise.
fn flatten(envelope: &Envelope) -> Fields {
    envelope.row().cloned().unwrap_or_default()
}

fn metadata(envelope: &Envelope) -> Fields {
    let mut metadata = envelope.extra.clone();
    if let Some(operation) = envelope.operation {
        metadata.insert("operation", operation.code());
    }
    if let Some(transaction) = &envelope.transaction {
        metadata.insert("transaction", transaction.clone());
    }
    if let Some(source) = &envelope.source {
        metadata.insert("source", Value::Source(Box::new(source.clone())));
    }
    if let Some(timestamp) = envelope.timestamp {
        metadata.insert("timestamp", Value::Timestamp(timestamp));
    }
    metadata
}
