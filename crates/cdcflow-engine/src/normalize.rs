//! Engine-native value normalization.
//!
//! [`normalize`] is total over [`ConnectValue`]: every payload either maps
//! to a [`Value`] or yields a [`ConversionError`] naming what went wrong.
//! Logical tags are dispatched before structural kinds.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeDelta};

use cdcflow_types::connect::ConnectValue;
use cdcflow_types::{
    ChangeMessage, ConversionError, Envelope, Fields, Interval, LogicalType, Message, Payload,
    Schema, SchemaType, TimeUnit, Value, ZonedTime,
};

use crate::connector::RawChangeRecord;

const NANOS_PER_DAY: i64 = 86_400 * 1_000_000_000;

/// Normalize a record's key and value.
///
/// # Errors
///
/// Returns a [`ConversionError`] if either side does not fit its schema.
pub fn convert_record(record: &RawChangeRecord) -> Result<ChangeMessage, ConversionError> {
    let key = match normalize(record.key_schema.as_ref(), record.key.as_ref())? {
        Value::Null => None,
        key => Some(key),
    };
    let value = match normalize(record.value_schema.as_ref(), record.value.as_ref())? {
        Value::Null => None,
        Value::Change(envelope) => Some(Payload::Envelope(*envelope)),
        Value::Map(fields) => Some(Payload::Message(Message::from_fields(fields)?)),
        other => Some(Payload::Message(Message {
            source: None,
            extra: Fields::from([("value", other)]),
        })),
    };
    Ok(ChangeMessage { key, value })
}

/// Normalize one value against its (optional) schema.
///
/// # Errors
///
/// Returns a [`ConversionError`] on a kind mismatch, an unparseable logical
/// payload, or a missing required value.
pub fn normalize(
    schema: Option<&Schema>,
    value: Option<&ConnectValue>,
) -> Result<Value, ConversionError> {
    match (schema, value) {
        (None, None) => Ok(Value::Null),
        (None, Some(value)) => schemaless(value),
        (Some(schema), None) => absent(schema, "value"),
        (Some(schema), Some(value)) => match schema.logical_type() {
            Some(logical) => convert_logical(logical, value),
            None => convert_structural(schema, value),
        },
    }
}

/// A missing value: its default if the schema has one, else null if
/// optional.
fn absent(schema: &Schema, context: &str) -> Result<Value, ConversionError> {
    if let Some(default) = &schema.default {
        if let Some(default) = ConnectValue::from_json(schema, default)
            .map_err(|e| ConversionError::InvalidDefault(format!("{context}: {e}")))?
        {
            return normalize(Some(schema), Some(&default));
        }
    }
    if schema.optional {
        return Ok(Value::Null);
    }
    Err(ConversionError::MissingRequired {
        context: context.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Logical tags
// ---------------------------------------------------------------------------

fn convert_logical(logical: LogicalType, value: &ConnectValue) -> Result<Value, ConversionError> {
    let out_of_range = |raw: i64| ConversionError::OutOfRange {
        logical,
        value: raw.to_string(),
    };

    match logical {
        LogicalType::Date => {
            let ConnectValue::Int32(days) = value else {
                return Err(ConversionError::logical(logical, "int32", value.kind_name()));
            };
            epoch_day(i64::from(*days))
                .map(Value::Date)
                .ok_or_else(|| out_of_range(i64::from(*days)))
        }
        LogicalType::Time(unit) => {
            let raw = match value {
                ConnectValue::Int32(v) => i64::from(*v),
                ConnectValue::Int64(v) => *v,
                other => {
                    return Err(ConversionError::logical(
                        logical,
                        "int32 or int64",
                        other.kind_name(),
                    ))
                }
            };
            time_of_day(raw, unit)
                .map(Value::Time)
                .ok_or_else(|| out_of_range(raw))
        }
        LogicalType::Timestamp(unit) => {
            let raw = expect_int64(logical, value)?;
            let per_second = TimeUnit::Seconds.nanos() / unit.nanos();
            let seconds = raw.div_euclid(per_second);
            let sub = raw.rem_euclid(per_second) * unit.nanos();
            u32::try_from(sub)
                .ok()
                .and_then(|nanos| DateTime::from_timestamp(seconds, nanos))
                .map(Value::Timestamp)
                .ok_or_else(|| out_of_range(raw))
        }
        LogicalType::Duration(unit) => {
            let raw = expect_int64(logical, value)?;
            let duration = match unit {
                TimeUnit::Seconds => TimeDelta::try_seconds(raw),
                TimeUnit::Millis => TimeDelta::try_milliseconds(raw),
                TimeUnit::Micros => Some(TimeDelta::microseconds(raw)),
                TimeUnit::Nanos => Some(TimeDelta::nanoseconds(raw)),
            };
            duration.map(Value::Duration).ok_or_else(|| out_of_range(raw))
        }
        LogicalType::Interval => {
            let text = expect_string(logical, value)?;
            text.parse::<Interval>()
                .map(Value::Interval)
                .map_err(|reason| parse_error(logical, text, reason))
        }
        LogicalType::Decimal => match value {
            ConnectValue::Decimal(decimal) => Ok(Value::Decimal(decimal.clone())),
            other => Err(ConversionError::logical(logical, "decimal", other.kind_name())),
        },
        LogicalType::Year => {
            let ConnectValue::Int32(year) = value else {
                return Err(ConversionError::logical(logical, "int32", value.kind_name()));
            };
            NaiveDate::from_ymd_opt(*year, 1, 1)
                .map(Value::Date)
                .ok_or_else(|| out_of_range(i64::from(*year)))
        }
        LogicalType::ZonedTime => {
            let text = expect_string(logical, value)?;
            text.parse::<ZonedTime>()
                .map(Value::ZonedTime)
                .map_err(|reason| parse_error(logical, text, reason))
        }
        LogicalType::ZonedTimestamp => {
            let text = expect_string(logical, value)?;
            DateTime::<FixedOffset>::parse_from_rfc3339(text)
                .map(Value::ZonedTimestamp)
                .map_err(|e| parse_error(logical, text, e.to_string()))
        }
    }
}

fn epoch_day(days: i64) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1970, 1, 1)?.checked_add_signed(TimeDelta::try_days(days)?)
}

fn time_of_day(raw: i64, unit: TimeUnit) -> Option<NaiveTime> {
    let nanos = raw.checked_mul(unit.nanos())?;
    if !(0..NANOS_PER_DAY).contains(&nanos) {
        return None;
    }
    let seconds = u32::try_from(nanos / 1_000_000_000).ok()?;
    let sub = u32::try_from(nanos % 1_000_000_000).ok()?;
    NaiveTime::from_num_seconds_from_midnight_opt(seconds, sub)
}

fn expect_int64(logical: LogicalType, value: &ConnectValue) -> Result<i64, ConversionError> {
    match value {
        ConnectValue::Int64(v) => Ok(*v),
        other => Err(ConversionError::logical(logical, "int64", other.kind_name())),
    }
}

fn expect_string(logical: LogicalType, value: &ConnectValue) -> Result<&str, ConversionError> {
    match value {
        ConnectValue::String(s) => Ok(s),
        other => Err(ConversionError::logical(logical, "string", other.kind_name())),
    }
}

fn parse_error(logical: LogicalType, input: &str, reason: String) -> ConversionError {
    ConversionError::Parse {
        logical,
        input: input.to_string(),
        reason,
    }
}

// ---------------------------------------------------------------------------
// Structural kinds
// ---------------------------------------------------------------------------

fn convert_structural(schema: &Schema, value: &ConnectValue) -> Result<Value, ConversionError> {
    let mismatch = || ConversionError::TypeMismatch {
        expected: schema.kind,
        actual: value.kind_name(),
    };

    Ok(match (schema.kind, value) {
        (SchemaType::Int8, ConnectValue::Int8(v)) => Value::Int8(*v),
        (SchemaType::Int16, ConnectValue::Int16(v)) => Value::Int16(*v),
        (SchemaType::Int32, ConnectValue::Int32(v)) => Value::Int32(*v),
        (SchemaType::Int64, ConnectValue::Int64(v)) => Value::Int64(*v),
        (SchemaType::Float32, ConnectValue::Float32(v)) => Value::Float32(*v),
        (SchemaType::Float64, ConnectValue::Float64(v)) => Value::Float64(*v),
        (SchemaType::Boolean, ConnectValue::Boolean(v)) => Value::Boolean(*v),
        (SchemaType::String, ConnectValue::String(v)) => Value::String(v.clone()),
        (SchemaType::Bytes, ConnectValue::Bytes(v)) => Value::Bytes(v.clone()),
        (SchemaType::Array, ConnectValue::Array(items)) => {
            let element = schema.value_schema.as_deref();
            Value::Array(
                items
                    .iter()
                    .map(|item| normalize(element, item.as_ref()))
                    .collect::<Result<_, _>>()?,
            )
        }
        (SchemaType::Map, ConnectValue::Map(entries)) => convert_map(schema, entries)?,
        (SchemaType::Struct, ConnectValue::Struct(row)) => {
            if row.schema() != schema {
                return Err(ConversionError::SchemaMismatch {
                    name: schema.name.clone().unwrap_or_default(),
                });
            }
            let mut fields = Fields::with_capacity(schema.fields.len());
            for (field, slot) in schema.fields.iter().zip(row.values()) {
                let converted = match slot {
                    Some(v) => normalize(Some(&field.schema), Some(v))?,
                    None => absent(&field.schema, &format!("field '{}'", field.name))?,
                };
                fields.insert(field.name.clone(), converted);
            }
            if schema.is_envelope() {
                Value::Change(Box::new(Envelope::from_fields(fields)?))
            } else {
                Value::Map(fields)
            }
        }
        _ => return Err(mismatch()),
    })
}

fn convert_map(
    schema: &Schema,
    entries: &[(ConnectValue, Option<ConnectValue>)],
) -> Result<Value, ConversionError> {
    let key_schema = schema
        .key_schema
        .as_deref()
        .ok_or(ConversionError::IncompleteSchema {
            kind: SchemaType::Map,
            part: "key",
        })?;
    let value_schema = schema.value_schema.as_deref();

    if key_schema.kind == SchemaType::String {
        let mut fields = Fields::with_capacity(entries.len());
        for (key, value) in entries {
            let Value::String(key) = normalize(Some(key_schema), Some(key))? else {
                return Err(ConversionError::TypeMismatch {
                    expected: SchemaType::String,
                    actual: key.kind_name(),
                });
            };
            fields.insert(key, normalize(value_schema, value.as_ref())?);
        }
        Ok(Value::Map(fields))
    } else {
        entries
            .iter()
            .map(|(key, value)| {
                Ok((
                    normalize(Some(key_schema), Some(key))?,
                    normalize(value_schema, value.as_ref())?,
                ))
            })
            .collect::<Result<_, _>>()
            .map(Value::Pairs)
    }
}

/// Normalize by the payload's own kind.
fn schemaless(value: &ConnectValue) -> Result<Value, ConversionError> {
    Ok(match value {
        ConnectValue::Int8(v) => Value::Int8(*v),
        ConnectValue::Int16(v) => Value::Int16(*v),
        ConnectValue::Int32(v) => Value::Int32(*v),
        ConnectValue::Int64(v) => Value::Int64(*v),
        ConnectValue::Float32(v) => Value::Float32(*v),
        ConnectValue::Float64(v) => Value::Float64(*v),
        ConnectValue::Boolean(v) => Value::Boolean(*v),
        ConnectValue::String(v) => Value::String(v.clone()),
        ConnectValue::Bytes(v) => Value::Bytes(v.clone()),
        ConnectValue::Decimal(v) => Value::Decimal(v.clone()),
        ConnectValue::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| normalize(None, item.as_ref()))
                .collect::<Result<_, _>>()?,
        ),
        ConnectValue::Map(entries) => {
            if entries.iter().all(|(k, _)| matches!(k, ConnectValue::String(_))) {
                let mut fields = Fields::with_capacity(entries.len());
                for (key, value) in entries {
                    if let ConnectValue::String(key) = key {
                        fields.insert(key.clone(), normalize(None, value.as_ref())?);
                    }
                }
                Value::Map(fields)
            } else {
                Value::Pairs(
                    entries
                        .iter()
                        .map(|(k, v)| Ok((schemaless(k)?, normalize(None, v.as_ref())?)))
                        .collect::<Result<_, ConversionError>>()?,
                )
            }
        }
        ConnectValue::Struct(row) => return convert_structural(row.schema(), value),
    })
}
