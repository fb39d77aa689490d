//! Row-change envelopes and the messages that carry them.

use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::error::ConversionError;
use crate::value::{Fields, Value};

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Kind of row change, identified on the wire by a one-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Row read during the initial snapshot (`r`).
    Read,
    Create,
    Update,
    Delete,
    Truncate,
    /// Logical decoding message (`m`).
    Message,
}

impl Operation {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Create => "c",
            Self::Update => "u",
            Self::Delete => "d",
            Self::Truncate => "t",
            Self::Message => "m",
        }
    }

    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "r" => Some(Self::Read),
            "c" => Some(Self::Create),
            "u" => Some(Self::Update),
            "d" => Some(Self::Delete),
            "t" => Some(Self::Truncate),
            "m" => Some(Self::Message),
            _ => None,
        }
    }

    /// Whether the change removes rows.
    #[must_use]
    pub fn is_removal(self) -> bool {
        matches!(self, Self::Delete | Self::Truncate)
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Where a change came from.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Source {
    pub version: Option<String>,
    pub connector: Option<String>,
    pub name: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Snapshot marker as reported by the connector (`true`, `last`, ...).
    pub snapshot: Option<String>,
    pub db: Option<String>,
    pub table: Option<String>,
    pub row: Option<i32>,
    pub extra: Fields,
}

impl Source {
    /// Build from a normalized `source` struct. Unknown members land in
    /// `extra`.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidEnvelope`] if a known member has
    /// the wrong kind.
    pub fn from_fields(mut fields: Fields) -> Result<Self, ConversionError> {
        let snapshot = match fields.remove("snapshot") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(Value::Boolean(b)) => Some(b.to_string()),
            Some(other) => return Err(wrong_kind("source.snapshot", "string", &other)),
        };
        let row = match fields.remove("row") {
            None | Some(Value::Null) => None,
            Some(value) => {
                let wide = value
                    .as_i64()
                    .ok_or_else(|| wrong_kind("source.row", "integer", &value))?;
                Some(i32::try_from(wide).map_err(|_| {
                    ConversionError::InvalidEnvelope(format!("source.row {wide} out of range"))
                })?)
            }
        };
        Ok(Self {
            version: take_string(&mut fields, "version")?,
            connector: take_string(&mut fields, "connector")?,
            name: take_string(&mut fields, "name")?,
            timestamp: take_millis(&mut fields, "ts_ms")?,
            snapshot,
            db: take_string(&mut fields, "db")?,
            table: take_string(&mut fields, "table")?,
            row,
            extra: fields,
        })
    }
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (key, value) in [
            ("version", &self.version),
            ("connector", &self.connector),
            ("name", &self.name),
        ] {
            if let Some(value) = value {
                map.serialize_entry(key, value)?;
            }
        }
        if let Some(ts) = self.timestamp {
            map.serialize_entry("ts_ms", &ts.timestamp_millis())?;
        }
        for (key, value) in [
            ("snapshot", &self.snapshot),
            ("db", &self.db),
            ("table", &self.table),
        ] {
            if let Some(value) = value {
                map.serialize_entry(key, value)?;
            }
        }
        if let Some(row) = self.row {
            map.serialize_entry("row", &row)?;
        }
        for (key, value) in self.extra.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One normalized row change.
///
/// `after` is authoritative for every operation except [`Operation::Delete`],
/// where only `before` carries the row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    pub operation: Option<Operation>,
    pub before: Option<Fields>,
    pub after: Option<Fields>,
    pub source: Option<Source>,
    pub transaction: Option<Fields>,
    pub timestamp: Option<DateTime<Utc>>,
    pub extra: Fields,
}

impl Envelope {
    /// Build from a normalized envelope struct.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidEnvelope`] for an unknown operation
    /// code or a member of the wrong kind.
    pub fn from_fields(mut fields: Fields) -> Result<Self, ConversionError> {
        let operation = match fields.remove("op") {
            None | Some(Value::Null) => None,
            Some(Value::String(code)) => Some(Operation::from_code(&code).ok_or_else(|| {
                ConversionError::InvalidEnvelope(format!("unknown operation code '{code}'"))
            })?),
            Some(other) => return Err(wrong_kind("op", "string", &other)),
        };
        let source = take_map(&mut fields, "source")?
            .map(Source::from_fields)
            .transpose()?;
        Ok(Self {
            operation,
            before: take_map(&mut fields, "before")?,
            after: take_map(&mut fields, "after")?,
            source,
            transaction: take_map(&mut fields, "transaction")?,
            timestamp: take_millis(&mut fields, "ts_ms")?,
            extra: fields,
        })
    }

    /// The row image that describes this change.
    #[must_use]
    pub fn row(&self) -> Option<&Fields> {
        if self.operation == Some(Operation::Delete) {
            self.before.as_ref()
        } else {
            self.after.as_ref()
        }
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("op", &self.operation)?;
        map.serialize_entry("ts_ms", &self.timestamp.map(|ts| ts.timestamp_millis()))?;
        map.serialize_entry("before", &self.before)?;
        map.serialize_entry("after", &self.after)?;
        map.serialize_entry("source", &self.source)?;
        map.serialize_entry("transaction", &self.transaction)?;
        for (key, value) in self.extra.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

// ---------------------------------------------------------------------------
// Message / Payload
// ---------------------------------------------------------------------------

/// A non-envelope value: schema change notification, heartbeat, ...
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub source: Option<Source>,
    pub extra: Fields,
}

impl Message {
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidEnvelope`] if `source` is present
    /// but malformed.
    pub fn from_fields(mut fields: Fields) -> Result<Self, ConversionError> {
        let source = take_map(&mut fields, "source")?
            .map(Source::from_fields)
            .transpose()?;
        Ok(Self {
            source,
            extra: fields,
        })
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(source) = &self.source {
            map.serialize_entry("source", source)?;
        }
        for (key, value) in self.extra.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Normalized record value.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Envelope(Envelope),
    Message(Message),
}

impl Payload {
    #[must_use]
    pub fn as_envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Envelope(envelope) => Some(envelope),
            Self::Message(_) => None,
        }
    }

    #[must_use]
    pub fn source(&self) -> Option<&Source> {
        match self {
            Self::Envelope(envelope) => envelope.source.as_ref(),
            Self::Message(message) => message.source.as_ref(),
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Envelope(envelope) => envelope.serialize(serializer),
            Self::Message(message) => message.serialize(serializer),
        }
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Envelope(envelope) => Value::Change(Box::new(envelope)),
            Payload::Message(message) => Value::Message(Box::new(message)),
        }
    }
}

/// A normalized key/value pair as handed to shaping.
///
/// `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ChangeMessage {
    pub key: Option<Value>,
    pub value: Option<Payload>,
}

impl ChangeMessage {
    #[must_use]
    pub fn envelope(&self) -> Option<&Envelope> {
        self.value.as_ref().and_then(Payload::as_envelope)
    }
}

// ---------------------------------------------------------------------------
// Member extraction helpers
// ---------------------------------------------------------------------------

fn wrong_kind(member: &str, expected: &str, actual: &Value) -> ConversionError {
    ConversionError::InvalidEnvelope(format!(
        "'{member}' must be {expected}, got {}",
        actual.kind_name()
    ))
}

fn take_string(fields: &mut Fields, member: &str) -> Result<Option<String>, ConversionError> {
    match fields.remove(member) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(wrong_kind(member, "string", &other)),
    }
}

fn take_map(fields: &mut Fields, member: &str) -> Result<Option<Fields>, ConversionError> {
    match fields.remove(member) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Map(map)) => Ok(Some(map)),
        Some(other) => Err(wrong_kind(member, "a struct", &other)),
    }
}

fn take_millis(
    fields: &mut Fields,
    member: &str,
) -> Result<Option<DateTime<Utc>>, ConversionError> {
    match fields.remove(member) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Timestamp(ts)) => Ok(Some(ts)),
        Some(value) => {
            let millis = value
                .as_i64()
                .ok_or_else(|| wrong_kind(member, "epoch milliseconds", &value))?;
            DateTime::from_timestamp_millis(millis)
                .map(Some)
                .ok_or_else(|| {
                    ConversionError::InvalidEnvelope(format!("'{member}' {millis} out of range"))
                })
        }
    }
}
