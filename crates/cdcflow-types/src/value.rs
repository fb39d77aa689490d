//! Normalized values.
//!
//! [`Value`] is the semantic tree produced by normalization. It serializes to
//! plain JSON: bytes as base64, decimals as strings, temporal values as
//! ISO-8601 strings.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use bigdecimal::BigDecimal;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, SecondsFormat, TimeDelta, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::envelope::{Envelope, Message, Source};

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_MINUTE: i64 = 60 * MICROS_PER_SECOND;
const MICROS_PER_HOUR: i64 = 60 * MICROS_PER_MINUTE;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A normalized, storage-ready value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Decimal(BigDecimal),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    Duration(TimeDelta),
    Interval(Interval),
    ZonedTime(ZonedTime),
    ZonedTimestamp(DateTime<FixedOffset>),
    Array(Vec<Value>),
    /// String-keyed map, in insertion order.
    Map(Fields),
    /// Map whose keys are not strings, kept as `[key, value]` pairs.
    Pairs(Vec<(Value, Value)>),
    Change(Box<Envelope>),
    /// Non-envelope payload, kept whole for raw output.
    Message(Box<Message>),
    Source(Box<Source>),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_fields(&self) -> Option<&Fields> {
        match self {
            Self::Map(fields) => Some(fields),
            _ => None,
        }
    }

    /// Widen any integer variant to `i64`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v) => Some(i64::from(*v)),
            Self::Int16(v) => Some(i64::from(*v)),
            Self::Int32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Name of the value's kind, for error messages.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Int8(_) => "int8",
            Self::Int16(_) => "int16",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float32(_) => "float32",
            Self::Float64(_) => "float64",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Decimal(_) => "decimal",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::Timestamp(_) => "timestamp",
            Self::Duration(_) => "duration",
            Self::Interval(_) => "interval",
            Self::ZonedTime(_) => "zoned_time",
            Self::ZonedTimestamp(_) => "zoned_timestamp",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Pairs(_) => "pairs",
            Self::Change(_) => "change",
            Self::Message(_) => "message",
            Self::Source(_) => "source",
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Fields> for Value {
    fn from(value: Fields) -> Self {
        Self::Map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Boolean(v) => serializer.serialize_bool(*v),
            Self::Int8(v) => serializer.serialize_i8(*v),
            Self::Int16(v) => serializer.serialize_i16(*v),
            Self::Int32(v) => serializer.serialize_i32(*v),
            Self::Int64(v) => serializer.serialize_i64(*v),
            Self::Float32(v) => serializer.serialize_f32(*v),
            Self::Float64(v) => serializer.serialize_f64(*v),
            Self::String(v) => serializer.serialize_str(v),
            Self::Bytes(v) => {
                serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(v))
            }
            Self::Decimal(v) => serializer.collect_str(v),
            Self::Date(v) => serializer.collect_str(v),
            Self::Time(v) => serializer.collect_str(v),
            Self::Timestamp(v) => {
                serializer.serialize_str(&v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Self::Duration(v) => serializer.serialize_str(&format_duration(*v)),
            Self::Interval(v) => serializer.collect_str(v),
            Self::ZonedTime(v) => serializer.collect_str(v),
            Self::ZonedTimestamp(v) => {
                serializer.serialize_str(&v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Self::Array(items) => serializer.collect_seq(items),
            Self::Map(fields) => fields.serialize(serializer),
            Self::Pairs(pairs) => serializer.collect_seq(pairs.iter().map(|(k, v)| (k, v))),
            Self::Change(envelope) => envelope.serialize(serializer),
            Self::Message(message) => message.serialize(serializer),
            Self::Source(source) => source.serialize(serializer),
        }
    }
}

/// ISO-8601 rendering of a signed duration, e.g. `PT1H2M3.5S` or `-PT0.25S`.
#[must_use]
pub fn format_duration(duration: TimeDelta) -> String {
    let total_nanos =
        i128::from(duration.num_seconds()) * 1_000_000_000 + i128::from(duration.subsec_nanos());
    let sign = if total_nanos < 0 { "-" } else { "" };
    let abs = total_nanos.unsigned_abs();
    let secs_total = abs / 1_000_000_000;
    let nanos = abs % 1_000_000_000;
    let hours = secs_total / 3600;
    let minutes = (secs_total % 3600) / 60;
    let secs = secs_total % 60;

    let mut out = format!("{sign}PT");
    if hours != 0 {
        out.push_str(&format!("{hours}H"));
    }
    if minutes != 0 {
        out.push_str(&format!("{minutes}M"));
    }
    if secs != 0 || nanos != 0 || (hours == 0 && minutes == 0) {
        out.push_str(&secs.to_string());
        push_fraction(&mut out, nanos, 9);
        out.push('S');
    }
    out
}

/// Append `.fraction` with trailing zeros trimmed; nothing when zero.
fn push_fraction(out: &mut String, fraction: u128, width: usize) {
    if fraction == 0 {
        return;
    }
    let digits = format!("{fraction:0width$}");
    out.push('.');
    out.push_str(digits.trim_end_matches('0'));
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Ordered string-keyed map.
///
/// Insertion order is preserved; inserting an existing key replaces the
/// value in place.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fields(Vec<(String, Value)>);

impl Fields {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Insert or replace; returns the previous value for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.0.push((key, value));
                None
            }
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(index).1)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    /// Merge `other` into `self`; keys from `other` win.
    pub fn merge(&mut self, other: Fields) {
        for (key, value) in other {
            self.insert(key, value);
        }
    }
}

impl FromIterator<(String, Value)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (key, value) in iter {
            fields.insert(key, value);
        }
        fields
    }
}

impl IntoIterator for Fields {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<const N: usize> From<[(&str, Value); N]> for Fields {
    fn from(entries: [(&str, Value); N]) -> Self {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

impl Serialize for Fields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

/// Calendar interval with independent year, month, day and time parts.
///
/// Parsed from and rendered as an ISO-8601 duration such as
/// `P1Y2M3DT4H5M6.78S`. Each part may carry its own sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    pub years: i32,
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

impl Interval {
    fn is_zero(&self) -> bool {
        self.years == 0 && self.months == 0 && self.days == 0 && self.micros == 0
    }

    fn negated(self) -> Option<Self> {
        Some(Self {
            years: self.years.checked_neg()?,
            months: self.months.checked_neg()?,
            days: self.days.checked_neg()?,
            micros: self.micros.checked_neg()?,
        })
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (negate, rest) = match input.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, input),
        };
        let rest = rest
            .strip_prefix('P')
            .ok_or_else(|| "missing 'P' designator".to_string())?;
        let (date, time) = match rest.split_once('T') {
            Some((date, time)) => (date, Some(time)),
            None => (rest, None),
        };
        if date.is_empty() && time.map_or(true, str::is_empty) {
            return Err("no interval components".to_string());
        }

        let overflow = || format!("interval '{input}' out of range");
        let mut interval = Interval::default();
        for (number, unit) in components(date)? {
            let n: i32 = number
                .parse()
                .map_err(|_| format!("invalid number '{number}'"))?;
            let (slot, n) = match unit {
                'Y' => (&mut interval.years, n),
                'M' => (&mut interval.months, n),
                'W' => (&mut interval.days, n.checked_mul(7).ok_or_else(overflow)?),
                'D' => (&mut interval.days, n),
                other => return Err(format!("unexpected date designator '{other}'")),
            };
            *slot = slot.checked_add(n).ok_or_else(overflow)?;
        }
        if let Some(time) = time {
            if time.is_empty() {
                return Err("empty time part after 'T'".to_string());
            }
            for (number, unit) in components(time)? {
                let scale = match unit {
                    'H' => MICROS_PER_HOUR,
                    'M' => MICROS_PER_MINUTE,
                    'S' => MICROS_PER_SECOND,
                    other => return Err(format!("unexpected time designator '{other}'")),
                };
                interval.micros = interval
                    .micros
                    .checked_add(parse_scaled(number, scale)?)
                    .ok_or_else(overflow)?;
            }
        }
        if negate {
            interval.negated().ok_or_else(overflow)
        } else {
            Ok(interval)
        }
    }
}

/// Split `1Y-2M3D` into `[("1", 'Y'), ("-2", 'M'), ("3", 'D')]`.
fn components(part: &str) -> Result<Vec<(&str, char)>, String> {
    let mut out = Vec::new();
    let mut start = 0;
    for (index, c) in part.char_indices() {
        if c.is_ascii_alphabetic() {
            let number = &part[start..index];
            if number.is_empty() {
                return Err(format!("missing number before '{c}'"));
            }
            out.push((number, c));
            start = index + c.len_utf8();
        }
    }
    if start != part.len() {
        return Err(format!("dangling number '{}'", &part[start..]));
    }
    Ok(out)
}

/// Parse a possibly fractional, possibly negative decimal into `scale` units.
fn parse_scaled(number: &str, scale: i64) -> Result<i64, String> {
    let invalid = || format!("invalid number '{number}'");
    let (negative, digits) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number),
    };
    let (whole, fraction) = match digits.split_once(['.', ',']) {
        Some((whole, fraction)) => (whole, fraction),
        None => (digits, ""),
    };
    let whole: i64 = whole.parse().map_err(|_| invalid())?;
    let mut value = whole.checked_mul(scale).ok_or_else(invalid)?;
    if !fraction.is_empty() {
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let mut unit = scale;
        for digit in fraction.bytes() {
            unit /= 10;
            if unit == 0 {
                break;
            }
            value = value
                .checked_add(i64::from(digit - b'0') * unit)
                .ok_or_else(invalid)?;
        }
    }
    if negative {
        value.checked_neg().ok_or_else(invalid)
    } else {
        Ok(value)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("PT0S");
        }
        f.write_str("P")?;
        if self.years != 0 {
            write!(f, "{}Y", self.years)?;
        }
        if self.months != 0 {
            write!(f, "{}M", self.months)?;
        }
        if self.days != 0 {
            write!(f, "{}D", self.days)?;
        }
        if self.micros != 0 {
            f.write_str("T")?;
            let hours = self.micros / MICROS_PER_HOUR;
            let minutes = (self.micros % MICROS_PER_HOUR) / MICROS_PER_MINUTE;
            let seconds = self.micros % MICROS_PER_MINUTE;
            if hours != 0 {
                write!(f, "{hours}H")?;
            }
            if minutes != 0 {
                write!(f, "{minutes}M")?;
            }
            if seconds != 0 {
                let sign = if seconds < 0 { "-" } else { "" };
                let abs = seconds.unsigned_abs();
                let mut rendered = format!("{sign}{}", abs / 1_000_000);
                push_fraction(&mut rendered, u128::from(abs % 1_000_000), 6);
                write!(f, "{rendered}S")?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ZonedTime
// ---------------------------------------------------------------------------

/// Time of day with a fixed UTC offset, e.g. `10:15:30.5+01:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZonedTime {
    pub time: NaiveTime,
    pub offset: FixedOffset,
}

impl FromStr for ZonedTime {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (time, offset) = if let Some(time) = input.strip_suffix('Z') {
            (time, FixedOffset::east_opt(0).ok_or("invalid offset")?)
        } else {
            let split = input
                .rfind(['+', '-'])
                .ok_or_else(|| "missing UTC offset".to_string())?;
            let (time, offset) = input.split_at(split);
            (time, parse_offset(offset)?)
        };
        let time = NaiveTime::parse_from_str(time, "%H:%M:%S%.f")
            .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
            .map_err(|e| e.to_string())?;
        Ok(Self { time, offset })
    }
}

fn parse_offset(offset: &str) -> Result<FixedOffset, String> {
    let invalid = || format!("invalid UTC offset '{offset}'");
    let (sign, rest) = match offset.as_bytes().first() {
        Some(b'+') => (1, &offset[1..]),
        Some(b'-') => (-1, &offset[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    if hours.is_empty() || hours.len() > 2 || minutes.is_empty() || minutes.len() > 2 {
        return Err(invalid());
    }
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

impl fmt::Display for ZonedTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset.local_minus_utc() == 0 {
            write!(f, "{}Z", self.time)
        } else {
            write!(f, "{}{}", self.time, self.offset)
        }
    }
}
