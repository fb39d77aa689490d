//! Engine-native schema model.
//!
//! A [`Schema`] is the self-describing type tag attached to every key and
//! value an engine emits: a structural [`SchemaType`] plus an optional name
//! that may carry a [`LogicalType`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Well-known schema names
// ---------------------------------------------------------------------------

pub const DEBEZIUM_DATE: &str = "io.debezium.time.Date";
pub const DEBEZIUM_TIME: &str = "io.debezium.time.Time";
pub const DEBEZIUM_MICRO_TIME: &str = "io.debezium.time.MicroTime";
pub const DEBEZIUM_NANO_TIME: &str = "io.debezium.time.NanoTime";
pub const DEBEZIUM_TIMESTAMP: &str = "io.debezium.time.Timestamp";
pub const DEBEZIUM_MICRO_TIMESTAMP: &str = "io.debezium.time.MicroTimestamp";
pub const DEBEZIUM_NANO_TIMESTAMP: &str = "io.debezium.time.NanoTimestamp";
pub const DEBEZIUM_MICRO_DURATION: &str = "io.debezium.time.MicroDuration";
pub const DEBEZIUM_NANO_DURATION: &str = "io.debezium.time.NanoDuration";
pub const DEBEZIUM_INTERVAL: &str = "io.debezium.time.Interval";
pub const DEBEZIUM_YEAR: &str = "io.debezium.time.Year";
pub const DEBEZIUM_ZONED_TIME: &str = "io.debezium.time.ZonedTime";
pub const DEBEZIUM_ZONED_TIMESTAMP: &str = "io.debezium.time.ZonedTimestamp";
pub const CONNECT_DATE: &str = "org.apache.kafka.connect.data.Date";
pub const CONNECT_TIME: &str = "org.apache.kafka.connect.data.Time";
pub const CONNECT_TIMESTAMP: &str = "org.apache.kafka.connect.data.Timestamp";
pub const CONNECT_DECIMAL: &str = "org.apache.kafka.connect.data.Decimal";

/// Suffix shared by every row-change envelope schema name
/// (e.g. `mysql.inventory.customers.Envelope`).
const ENVELOPE_SUFFIX: &str = ".Envelope";

// ---------------------------------------------------------------------------
// Structural kinds
// ---------------------------------------------------------------------------

/// Structural kind of a schema, independent of any logical tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Boolean,
    String,
    Bytes,
    Array,
    Map,
    Struct,
}

impl SchemaType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Array => "array",
            Self::Map => "map",
            Self::Struct => "struct",
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Logical tags
// ---------------------------------------------------------------------------

/// Precision of an integer-encoded temporal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

impl TimeUnit {
    /// Number of nanoseconds in one unit.
    #[must_use]
    pub fn nanos(self) -> i64 {
        match self {
            Self::Seconds => 1_000_000_000,
            Self::Millis => 1_000_000,
            Self::Micros => 1_000,
            Self::Nanos => 1,
        }
    }
}

/// Semantic tag layered over a structural kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    /// Days since the Unix epoch.
    Date,
    /// Time of day since midnight.
    Time(TimeUnit),
    /// Instant since the Unix epoch, UTC.
    Timestamp(TimeUnit),
    /// Signed elapsed duration.
    Duration(TimeUnit),
    /// ISO-8601 calendar interval string.
    Interval,
    /// Arbitrary-precision decimal.
    Decimal,
    /// Calendar year.
    Year,
    /// ISO-8601 time with offset string.
    ZonedTime,
    /// ISO-8601 timestamp with offset string.
    ZonedTimestamp,
}

impl LogicalType {
    /// Resolve a logical tag from a schema name, if the name is a known one.
    #[must_use]
    pub fn from_schema_name(name: &str) -> Option<Self> {
        let logical = match name {
            DEBEZIUM_DATE | CONNECT_DATE => Self::Date,
            DEBEZIUM_TIME | CONNECT_TIME => Self::Time(TimeUnit::Millis),
            DEBEZIUM_MICRO_TIME => Self::Time(TimeUnit::Micros),
            DEBEZIUM_NANO_TIME => Self::Time(TimeUnit::Nanos),
            DEBEZIUM_TIMESTAMP | CONNECT_TIMESTAMP => Self::Timestamp(TimeUnit::Millis),
            DEBEZIUM_MICRO_TIMESTAMP => Self::Timestamp(TimeUnit::Micros),
            DEBEZIUM_NANO_TIMESTAMP => Self::Timestamp(TimeUnit::Nanos),
            DEBEZIUM_MICRO_DURATION => Self::Duration(TimeUnit::Micros),
            DEBEZIUM_NANO_DURATION => Self::Duration(TimeUnit::Nanos),
            DEBEZIUM_INTERVAL => Self::Interval,
            CONNECT_DECIMAL => Self::Decimal,
            DEBEZIUM_YEAR => Self::Year,
            DEBEZIUM_ZONED_TIME => Self::ZonedTime,
            DEBEZIUM_ZONED_TIMESTAMP => Self::ZonedTimestamp,
            _ => return None,
        };
        Some(logical)
    }

    /// Human-readable tag name used in conversion errors.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Date => "Date",
            Self::Time(TimeUnit::Seconds) => "SecondTime",
            Self::Time(TimeUnit::Millis) => "Time",
            Self::Time(TimeUnit::Micros) => "MicroTime",
            Self::Time(TimeUnit::Nanos) => "NanoTime",
            Self::Timestamp(TimeUnit::Seconds) => "SecondTimestamp",
            Self::Timestamp(TimeUnit::Millis) => "Timestamp",
            Self::Timestamp(TimeUnit::Micros) => "MicroTimestamp",
            Self::Timestamp(TimeUnit::Nanos) => "NanoTimestamp",
            Self::Duration(TimeUnit::Seconds) => "SecondDuration",
            Self::Duration(TimeUnit::Millis) => "MilliDuration",
            Self::Duration(TimeUnit::Micros) => "MicroDuration",
            Self::Duration(TimeUnit::Nanos) => "NanoDuration",
            Self::Interval => "Interval",
            Self::Decimal => "Decimal",
            Self::Year => "Year",
            Self::ZonedTime => "ZonedTime",
            Self::ZonedTimestamp => "ZonedTimestamp",
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Self-describing type tag of an engine-native value.
///
/// `logical` overrides whatever tag `name` would resolve to; engines that
/// already know the logical tag of a column set it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type")]
    pub kind: SchemaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical: Option<LogicalType>,
    #[serde(default)]
    pub optional: bool,
    /// Default value, in the engine's JSON wire form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_schema: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_schema: Option<Box<Schema>>,
}

/// One named member of a struct schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
}

impl Schema {
    /// A required schema of the given kind.
    #[must_use]
    pub fn new(kind: SchemaType) -> Self {
        Self {
            kind,
            name: None,
            logical: None,
            optional: false,
            default: None,
            version: None,
            parameters: BTreeMap::new(),
            fields: Vec::new(),
            key_schema: None,
            value_schema: None,
        }
    }

    #[must_use]
    pub fn array(element: Schema) -> Self {
        let mut schema = Self::new(SchemaType::Array);
        schema.value_schema = Some(Box::new(element));
        schema
    }

    #[must_use]
    pub fn map(key: Schema, value: Schema) -> Self {
        let mut schema = Self::new(SchemaType::Map);
        schema.key_schema = Some(Box::new(key));
        schema.value_schema = Some(Box::new(value));
        schema
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_logical(mut self, logical: LogicalType) -> Self {
        self.logical = Some(logical);
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.fields.push(Field {
            name: name.into(),
            schema,
        });
        self
    }

    /// Effective logical tag: the explicit one, else the one named.
    #[must_use]
    pub fn logical_type(&self) -> Option<LogicalType> {
        self.logical
            .or_else(|| self.name.as_deref().and_then(LogicalType::from_schema_name))
    }

    /// Look up a struct field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether this schema describes a row-change envelope: a struct named
    /// `*.Envelope` carrying at least `op` and `source`.
    #[must_use]
    pub fn is_envelope(&self) -> bool {
        self.kind == SchemaType::Struct
            && self
                .name
                .as_deref()
                .is_some_and(|n| n.ends_with(ENVELOPE_SUFFIX))
            && self.field("op").is_some()
            && self.field("source").is_some()
    }
}
