//! Capture run result types.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::router::StreamOutput;

/// A named counter with tags, e.g. `records{source=inv.customers}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counter {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub value: u64,
}

impl Counter {
    /// Records accepted into one output stream.
    #[must_use]
    pub fn records(stream: &str, value: u64) -> Self {
        Self {
            name: "records".to_string(),
            tags: BTreeMap::from([("source".to_string(), stream.to_string())]),
            value,
        }
    }
}

/// Result of a bounded capture.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureOutput {
    /// Stream name -> stored file URI.
    pub uris: BTreeMap<String, String>,
    /// Accepted records across all streams.
    pub size: u64,
    pub state_offset_key: Option<String>,
    pub state_history_key: Option<String>,
    pub metrics: Vec<Counter>,
    pub duration_secs: f64,
}

/// Result of a realtime stream once it has stopped.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamSummary {
    /// Records emitted to the subscriber, `undelivered` included.
    pub emitted: u64,
    pub state_offset_key: Option<String>,
    pub state_history_key: Option<String>,
    pub duration_secs: f64,
    /// Records still buffered when the stream ended, in emission order.
    #[serde(skip)]
    pub undelivered: Vec<StreamOutput>,
}
