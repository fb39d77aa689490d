//! Conversion errors raised while normalizing engine-native values.

use thiserror::Error;

use crate::schema::{LogicalType, SchemaType};

/// Failure to turn an engine-native value into a normalized [`crate::Value`].
///
/// Conversion errors are fatal for the batch that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("invalid type for {logical}, expected {expected}, got {actual}")]
    LogicalTypeMismatch {
        logical: LogicalType,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid type for {expected} schema, got {actual}")]
    TypeMismatch {
        expected: SchemaType,
        actual: &'static str,
    },

    #[error("unable to parse {logical} value '{input}': {reason}")]
    Parse {
        logical: LogicalType,
        input: String,
        reason: String,
    },

    #[error("{logical} value {value} is out of range")]
    OutOfRange { logical: LogicalType, value: String },

    #[error("mismatching schema for struct '{name}'")]
    SchemaMismatch { name: String },

    #[error("missing required value for {context}")]
    MissingRequired { context: String },

    #[error("{kind} schema is missing its {part} schema")]
    IncompleteSchema {
        kind: SchemaType,
        part: &'static str,
    },

    #[error("invalid default value: {0}")]
    InvalidDefault(String),

    #[error("invalid change envelope: {0}")]
    InvalidEnvelope(String),
}

impl ConversionError {
    /// Payload kind does not match what `logical` requires.
    #[must_use]
    pub fn logical(
        logical: LogicalType,
        expected: &'static str,
        actual: &'static str,
    ) -> Self {
        Self::LogicalTypeMismatch {
            logical,
            expected,
            actual,
        }
    }
}
