//! Engine-native values.
//!
//! A [`ConnectValue`] is what the embedded engine hands over before any
//! normalization: a structural payload whose meaning only becomes clear
//! next to its [`Schema`].

use std::str::FromStr;

use base64::Engine as _;
use bigdecimal::BigDecimal;
use serde_json::Value as Json;

use crate::error::ConversionError;
use crate::schema::{LogicalType, Schema, SchemaType};

/// Runtime payload of an engine-native value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Boolean(bool),
    String(String),
    Bytes(Vec<u8>),
    Decimal(BigDecimal),
    Array(Vec<Option<ConnectValue>>),
    /// Entries in insertion order; keys may be of any kind.
    Map(Vec<(ConnectValue, Option<ConnectValue>)>),
    Struct(Struct),
}

impl ConnectValue {
    /// Name of the runtime kind, used in conversion errors.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Int8(_) => "int8",
            Self::Int16(_) => "int16",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float32(_) => "float32",
            Self::Float64(_) => "float64",
            Self::Boolean(_) => "boolean",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Decimal(_) => "decimal",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Struct(_) => "struct",
        }
    }
}

impl ConnectValue {
    /// Decode a JSON payload against `schema`, the way a schema-aware JSON
    /// converter reads records back. JSON `null` decodes to `None`.
    ///
    /// Decimals accept a JSON number or a numeric string; bytes are base64.
    /// Maps with string keys are JSON objects, any other map is an array of
    /// `[key, value]` pairs.
    ///
    /// # Errors
    ///
    /// Returns a [`ConversionError`] if the JSON shape does not fit `schema`.
    pub fn from_json(schema: &Schema, json: &Json) -> Result<Option<Self>, ConversionError> {
        if json.is_null() {
            return Ok(None);
        }
        let mismatch = || ConversionError::TypeMismatch {
            expected: schema.kind,
            actual: json_kind(json),
        };

        if schema.logical_type() == Some(LogicalType::Decimal) {
            let text = match json {
                Json::Number(n) => n.to_string(),
                Json::String(s) => s.clone(),
                _ => return Err(mismatch()),
            };
            let decimal = BigDecimal::from_str(&text).map_err(|e| ConversionError::Parse {
                logical: LogicalType::Decimal,
                input: text.clone(),
                reason: e.to_string(),
            })?;
            return Ok(Some(Self::Decimal(decimal)));
        }

        let value = match schema.kind {
            SchemaType::Int8 => Self::Int8(integer(json).ok_or_else(mismatch)?),
            SchemaType::Int16 => Self::Int16(integer(json).ok_or_else(mismatch)?),
            SchemaType::Int32 => Self::Int32(integer(json).ok_or_else(mismatch)?),
            SchemaType::Int64 => Self::Int64(integer(json).ok_or_else(mismatch)?),
            #[allow(clippy::cast_possible_truncation)]
            SchemaType::Float32 => Self::Float32(json.as_f64().ok_or_else(mismatch)? as f32),
            SchemaType::Float64 => Self::Float64(json.as_f64().ok_or_else(mismatch)?),
            SchemaType::Boolean => Self::Boolean(json.as_bool().ok_or_else(mismatch)?),
            SchemaType::String => Self::String(json.as_str().ok_or_else(mismatch)?.to_string()),
            SchemaType::Bytes => {
                let encoded = json.as_str().ok_or_else(mismatch)?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|_| mismatch())?;
                Self::Bytes(bytes)
            }
            SchemaType::Array => {
                let element = schema
                    .value_schema
                    .as_deref()
                    .ok_or(ConversionError::IncompleteSchema {
                        kind: SchemaType::Array,
                        part: "element",
                    })?;
                let items = json.as_array().ok_or_else(mismatch)?;
                Self::Array(
                    items
                        .iter()
                        .map(|item| Self::from_json(element, item))
                        .collect::<Result<_, _>>()?,
                )
            }
            SchemaType::Map => Self::Map(map_from_json(schema, json)?),
            SchemaType::Struct => {
                let object = json.as_object().ok_or_else(mismatch)?;
                let mut row = Struct::new(schema.clone())?;
                for (index, field) in schema.fields.iter().enumerate() {
                    if let Some(member) = object.get(&field.name) {
                        row.values[index] = Self::from_json(&field.schema, member)?;
                    }
                }
                Self::Struct(row)
            }
        };
        Ok(Some(value))
    }
}

fn integer<T: TryFrom<i64>>(json: &Json) -> Option<T> {
    json.as_i64().and_then(|n| T::try_from(n).ok())
}

type MapEntries = Vec<(ConnectValue, Option<ConnectValue>)>;

fn map_from_json(schema: &Schema, json: &Json) -> Result<MapEntries, ConversionError> {
    let incomplete = |part| ConversionError::IncompleteSchema {
        kind: SchemaType::Map,
        part,
    };
    let key_schema = schema.key_schema.as_deref().ok_or(incomplete("key"))?;
    let value_schema = schema.value_schema.as_deref().ok_or(incomplete("value"))?;
    let mismatch = || ConversionError::TypeMismatch {
        expected: SchemaType::Map,
        actual: json_kind(json),
    };

    match json {
        Json::Object(object) if key_schema.kind == SchemaType::String => object
            .iter()
            .map(|(k, v)| -> Result<_, ConversionError> {
                Ok((
                    ConnectValue::String(k.clone()),
                    ConnectValue::from_json(value_schema, v)?,
                ))
            })
            .collect(),
        Json::Array(pairs) => pairs
            .iter()
            .map(|pair| {
                let [k, v] = pair.as_array().map(Vec::as_slice).unwrap_or_default() else {
                    return Err(mismatch());
                };
                let key = ConnectValue::from_json(key_schema, k)?.ok_or_else(|| {
                    ConversionError::MissingRequired {
                        context: "map key".to_string(),
                    }
                })?;
                Ok((key, ConnectValue::from_json(value_schema, v)?))
            })
            .collect(),
        _ => Err(mismatch()),
    }
}

fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

impl From<&str> for ConnectValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ConnectValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i32> for ConnectValue {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<i64> for ConnectValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<bool> for ConnectValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Struct> for ConnectValue {
    fn from(value: Struct) -> Self {
        Self::Struct(value)
    }
}

/// A struct value: one optional slot per field of its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Struct {
    schema: Schema,
    values: Vec<Option<ConnectValue>>,
}

impl Struct {
    /// Empty struct for `schema`; every slot starts absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::TypeMismatch`] if `schema` is not a struct
    /// schema.
    pub fn new(schema: Schema) -> Result<Self, ConversionError> {
        if schema.kind != SchemaType::Struct {
            return Err(ConversionError::TypeMismatch {
                expected: SchemaType::Struct,
                actual: schema.kind.as_str(),
            });
        }
        let values = vec![None; schema.fields.len()];
        Ok(Self { schema, values })
    }

    /// Set a field by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::MissingRequired`] if the schema has no such
    /// field.
    pub fn put(
        &mut self,
        name: &str,
        value: impl Into<ConnectValue>,
    ) -> Result<&mut Self, ConversionError> {
        let index = self.index_of(name)?;
        self.values[index] = Some(value.into());
        Ok(self)
    }

    /// Builder form of [`Struct::put`].
    ///
    /// # Errors
    ///
    /// See [`Struct::put`].
    pub fn with(mut self, name: &str, value: impl Into<ConnectValue>) -> Result<Self, ConversionError> {
        self.put(name, value)?;
        Ok(self)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ConnectValue> {
        self.schema
            .fields
            .iter()
            .position(|f| f.name == name)
            .and_then(|i| self.values[i].as_ref())
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Field slots in schema declaration order.
    #[must_use]
    pub fn values(&self) -> &[Option<ConnectValue>] {
        &self.values
    }

    fn index_of(&self, name: &str) -> Result<usize, ConversionError> {
        self.schema
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| ConversionError::MissingRequired {
                context: format!(
                    "field '{name}' of struct '{}'",
                    self.schema.name.as_deref().unwrap_or("<unnamed>")
                ),
            })
    }
}
