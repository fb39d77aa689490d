//! Capture definition types, deserialized from YAML.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shape::ShapeOptions;

/// Top-level capture definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub version: String,
    /// Flow identity; prefixes checkpoint keys when set.
    #[serde(default)]
    pub flow: Option<String>,
    pub source: SourceConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub state: StateConfig,
}

/// A value given either as a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Connector kind, e.g. `replay`.
    #[serde(rename = "use")]
    pub use_ref: String,
    pub hostname: Option<String>,
    pub port: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub include_databases: Option<OneOrMany>,
    pub exclude_databases: Option<OneOrMany>,
    pub include_tables: Option<OneOrMany>,
    pub exclude_tables: Option<OneOrMany>,
    pub include_columns: Option<OneOrMany>,
    pub exclude_columns: Option<OneOrMany>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Raw engine properties, applied after everything else.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_topic_prefix() -> String {
    "cdcflow_".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(flatten)]
    pub shape: ShapeOptions,
    /// Where finalized stream files are copied by the CLI.
    pub directory: Option<PathBuf>,
}

/// Termination budgets for a bounded capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_records: Option<u64>,
    #[serde(default, with = "humantime_serde")]
    pub max_duration: Option<Duration>,
    #[serde(default = "default_max_wait", with = "humantime_serde")]
    pub max_wait: Option<Duration>,
    #[serde(default = "default_max_snapshot_duration", with = "humantime_serde")]
    pub max_snapshot_duration: Duration,
    /// Termination check resolution.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long draining waits for the engine thread.
    #[serde(default = "default_drain_grace", with = "humantime_serde")]
    pub drain_grace: Duration,
}

#[allow(clippy::unnecessary_wraps)]
fn default_max_wait() -> Option<Duration> {
    Some(Duration::from_secs(10))
}

fn default_max_snapshot_duration() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_drain_grace() -> Duration {
    Duration::from_secs(60)
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_records: None,
            max_duration: None,
            max_wait: default_max_wait(),
            max_snapshot_duration: default_max_snapshot_duration(),
            poll_interval: default_poll_interval(),
            drain_grace: default_drain_grace(),
        }
    }
}

/// When checkpoints are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OffsetsCommitMode {
    /// After every accepted batch.
    #[default]
    OnEachBatch,
    /// Once, after the engine stops cleanly.
    OnStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_name")]
    pub name: String,
    /// `SQLite` checkpoint database path.
    #[serde(default = "default_store_path")]
    pub store: PathBuf,
    /// Expire checkpoints this long after they are written.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
    /// Per-run discriminator; scopes checkpoints to one task run.
    pub task_run: Option<String>,
    #[serde(default)]
    pub hash_task_run: bool,
    #[serde(default)]
    pub offsets_commit_mode: OffsetsCommitMode,
}

fn default_state_name() -> String {
    "debezium-state".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".cdcflow/state.db")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            name: default_state_name(),
            store: default_store_path(),
            ttl: None,
            task_run: None,
            hash_task_run: false,
            offsets_commit_mode: OffsetsCommitMode::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{DeletedMode, Format, SplitTable};

    #[test]
    fn test_deserialize_minimal_capture() {
        let yaml = r#"
version: "1.0"
source:
  use: replay
  properties:
    replay.path: ./changes.jsonl
"#;
        let config: CaptureConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.source.use_ref, "replay");
        assert_eq!(config.source.topic_prefix, "cdcflow_");
        assert_eq!(config.source.properties["replay.path"], "./changes.jsonl");
        // Defaults applied
        assert_eq!(config.output.shape, ShapeOptions::default());
        assert_eq!(config.limits, LimitsConfig::default());
        assert_eq!(config.limits.max_wait, Some(Duration::from_secs(10)));
        assert_eq!(config.state.name, "debezium-state");
        assert_eq!(
            config.state.offsets_commit_mode,
            OffsetsCommitMode::OnEachBatch
        );
    }

    #[test]
    fn test_deserialize_full_capture() {
        let yaml = r#"
version: "1.0"
flow: company.team.inventory
source:
  use: replay
  hostname: db.internal
  port: "3306"
  username: cdc
  password: secret
  include_databases: inventory
  include_tables:
    - inventory.customers
    - inventory.orders
output:
  format: WRAP
  deleted: DROP
  split_table: DATABASE
  ignore_ddl: false
  directory: ./out
limits:
  max_records: 500
  max_duration: 5m
  max_wait: 250ms
  max_snapshot_duration: 2h
state:
  name: inventory-state
  store: /var/lib/cdcflow/state.db
  ttl: 7days
  task_run: run-7
  hash_task_run: true
  offsets_commit_mode: ON_STOP
"#;
        let config: CaptureConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.flow.as_deref(), Some("company.team.inventory"));
        assert_eq!(
            config.source.include_databases.as_ref().unwrap().as_slice(),
            ["inventory".to_string()]
        );
        assert_eq!(config.source.include_tables.as_ref().unwrap().as_slice().len(), 2);
        assert_eq!(config.output.shape.format, Format::Wrap);
        assert_eq!(config.output.shape.deleted, DeletedMode::Drop);
        assert_eq!(config.output.shape.split_table, SplitTable::Database);
        assert!(!config.output.shape.ignore_ddl);
        assert_eq!(config.output.shape.deleted_field_name, "deleted");
        assert_eq!(config.limits.max_records, Some(500));
        assert_eq!(config.limits.max_duration, Some(Duration::from_secs(300)));
        assert_eq!(config.limits.max_wait, Some(Duration::from_millis(250)));
        assert_eq!(
            config.limits.max_snapshot_duration,
            Duration::from_secs(7200)
        );
        assert_eq!(config.state.ttl, Some(Duration::from_secs(7 * 86_400)));
        assert!(config.state.hash_task_run);
        assert_eq!(config.state.offsets_commit_mode, OffsetsCommitMode::OnStop);
    }
}
