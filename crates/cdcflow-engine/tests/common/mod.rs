//! Shared helpers for engine integration tests: replay file builders and
//! capture definitions pointing at them.

#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use cdcflow_engine::config::parser::parse_capture_str;
use cdcflow_engine::config::types::CaptureConfig;
use cdcflow_state::{CheckpointStore, SqliteCheckpointStore};
use serde_json::{json, Value};

pub const SNAPSHOT: bool = true;
pub const STREAMING: bool = false;

pub fn memory_store() -> Arc<dyn CheckpointStore> {
    Arc::new(SqliteCheckpointStore::in_memory().unwrap())
}

fn row_schema(db: &str, table: &str) -> Value {
    json!({
        "type": "struct",
        "name": format!("{db}.{table}.Value"),
        "optional": true,
        "fields": [
            {"name": "id", "schema": {"type": "int32"}},
            {"name": "a", "schema": {"type": "int32", "optional": true}}
        ]
    })
}

fn source_schema() -> Value {
    json!({
        "type": "struct",
        "name": "io.debezium.connector.mysql.Source",
        "fields": [
            {"name": "version", "schema": {"type": "string"}},
            {"name": "connector", "schema": {"type": "string"}},
            {"name": "name", "schema": {"type": "string"}},
            {"name": "ts_ms", "schema": {"type": "int64"}},
            {"name": "snapshot", "schema": {"type": "string", "optional": true}},
            {"name": "db", "schema": {"type": "string"}},
            {"name": "table", "schema": {"type": "string", "optional": true}}
        ]
    })
}

fn envelope_schema(db: &str, table: &str) -> Value {
    json!({
        "type": "struct",
        "name": format!("{db}.{table}.Envelope"),
        "fields": [
            {"name": "before", "schema": row_schema(db, table)},
            {"name": "after", "schema": row_schema(db, table)},
            {"name": "source", "schema": source_schema()},
            {"name": "op", "schema": {"type": "string"}},
            {"name": "ts_ms", "schema": {"type": "int64", "optional": true}}
        ]
    })
}

fn key_schema(db: &str, table: &str) -> Value {
    json!({
        "type": "struct",
        "name": format!("{db}.{table}.Key"),
        "fields": [{"name": "id", "schema": {"type": "int32"}}]
    })
}

/// One replay line describing a row change.
///
/// `row` is the row image: `after` for creates, updates and reads, `before`
/// for deletes.
pub fn change(db: &str, table: &str, op: &str, id: i32, row: Value, snapshot: bool) -> String {
    let (before, after) = if op == "d" {
        (row, Value::Null)
    } else {
        (Value::Null, row)
    };
    let line = json!({
        "key_schema": key_schema(db, table),
        "key": {"id": id},
        "value_schema": envelope_schema(db, table),
        "value": {
            "before": before,
            "after": after,
            "source": {
                "version": "2.5.0",
                "connector": "mysql",
                "name": "dbserver1",
                "ts_ms": 1_700_000_000_000_i64,
                "snapshot": if snapshot { "true" } else { "false" },
                "db": db,
                "table": table
            },
            "op": op,
            "ts_ms": 1_700_000_000_123_i64
        },
        "source_offset": {"snapshot": snapshot}
    });
    line.to_string()
}

/// A create on `inventory.customers`.
pub fn insert(id: i32, a: i32, snapshot: bool) -> String {
    change("inventory", "customers", "c", id, json!({"id": id, "a": a}), snapshot)
}

/// A change whose row image lacks the required `id` column.
pub fn broken_insert() -> String {
    change("inventory", "customers", "c", 0, json!({"a": 1}), STREAMING)
}

pub fn write_replay(dir: &Path, lines: &[String]) -> std::path::PathBuf {
    let path = dir.join("changes.jsonl");
    let mut file = std::fs::File::create(&path).unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    path
}

pub fn append_replay(path: &Path, lines: &[String]) {
    let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
}

/// Capture definition replaying `replay` with fast polling. `extra` is
/// spliced under the top level and may override `output`, `limits` or
/// `state` sections.
pub fn capture_config(replay: &Path, properties: &str, extra: &str) -> CaptureConfig {
    let yaml = format!(
        r#"
version: "1.0"
flow: inventory
source:
  use: replay
  properties:
    replay.path: "{}"
    replay.poll.interval.ms: "20"
{properties}
{extra}
"#,
        replay.display()
    );
    let mut config = parse_capture_str(&yaml).unwrap();
    config.limits.poll_interval = std::time::Duration::from_millis(20);
    config
}

/// Read a finalized stream file into JSON records.
pub fn read_stream(uri: &str) -> Vec<Value> {
    let path = uri.strip_prefix("file://").unwrap();
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}
