//! Shared cdcflow model types.
//!
//! The engine-native side ([`schema`], [`connect`]) describes what the
//! embedded CDC engine emits. The normalized side ([`value`], [`envelope`])
//! is what the rest of the pipeline works with.

#![warn(clippy::pedantic)]

pub mod connect;
pub mod envelope;
pub mod error;
pub mod schema;
pub mod value;

pub use envelope::{ChangeMessage, Envelope, Message, Operation, Payload, Source};
pub use error::ConversionError;
pub use schema::{Field, LogicalType, Schema, SchemaType, TimeUnit};
pub use value::{Fields, Interval, Value, ZonedTime};
