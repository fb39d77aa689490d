//! End-to-end captures against the replay engine: bounded runs, resume from
//! persisted checkpoints, commit modes, and realtime streaming.

mod common;

use std::time::Duration;

use cdcflow_engine::config::parser::parse_capture;
use cdcflow_engine::config::validator::validate_capture;
use cdcflow_engine::replay::ReplayConnector;
use cdcflow_engine::resolve::state_scope;
use cdcflow_engine::{run_capture, start_stream, LocalStorage};
use cdcflow_state::CheckpointFile;
use rstest::rstest;
use serde_json::json;

use common::*;

const STOP_AT_END: &str = "    replay.stop.at.end: \"true\"";
const PLAIN_ROWS: &str = "output:\n  key: DROP\n  metadata: DROP\n";

fn stored_position(
    store: &dyn cdcflow_state::CheckpointStore,
    config: &cdcflow_engine::config::types::CaptureConfig,
) -> Option<u64> {
    let key = state_scope(config).key(CheckpointFile::Offsets);
    store.get(&key).unwrap().map(|bytes| {
        let offsets: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        offsets["position"].as_u64().unwrap()
    })
}

/// Rows land in one stream per table, flattened with a delete flag.
#[tokio::test]
async fn test_capture_routes_rows_per_table() {
    let dir = tempfile::tempdir().unwrap();
    let replay = write_replay(
        dir.path(),
        &[
            insert(1, 10, STREAMING),
            insert(2, 20, STREAMING),
            change("inventory", "orders", "c", 7, json!({"id": 7, "a": 70}), STREAMING),
            insert(3, 30, STREAMING),
        ],
    );
    let config = capture_config(&replay, STOP_AT_END, PLAIN_ROWS);
    let storage = LocalStorage::new(dir.path().join("out"));

    let output = run_capture(&config, &ReplayConnector, memory_store(), &storage)
        .await
        .expect("capture should succeed");

    assert_eq!(output.size, 4, "Expected 4 records, got {}", output.size);
    assert_eq!(
        output.uris.keys().collect::<Vec<_>>(),
        ["inventory.customers", "inventory.orders"]
    );
    let customers = read_stream(&output.uris["inventory.customers"]);
    assert_eq!(
        customers,
        vec![
            json!({"id": 1, "a": 10, "deleted": false}),
            json!({"id": 2, "a": 20, "deleted": false}),
            json!({"id": 3, "a": 30, "deleted": false}),
        ]
    );
    let orders = read_stream(&output.uris["inventory.orders"]);
    assert_eq!(orders, vec![json!({"id": 7, "a": 70, "deleted": false})]);

    let counts: Vec<_> = output.metrics.iter().map(|c| c.value).collect();
    assert_eq!(counts, [3, 1]);
    assert_eq!(
        output.metrics[0].tags["source"], "inventory.customers",
        "Counters are tagged with their stream"
    );
    assert!(output.state_offset_key.is_some());
    assert!(output.state_history_key.is_none());
}

/// Output layout follows `output.format`.
#[rstest]
#[case::inline("INLINE", json!({"id": 1, "a": 2, "deleted": false}))]
#[case::wrap("WRAP", json!({"record": {"id": 1, "a": 2}, "deleted": false}))]
#[tokio::test]
async fn test_capture_output_formats(#[case] format: &str, #[case] expected: serde_json::Value) {
    let dir = tempfile::tempdir().unwrap();
    let replay = write_replay(dir.path(), &[insert(1, 2, STREAMING)]);
    let extra = format!("{PLAIN_ROWS}  format: {format}\n");
    let config = capture_config(&replay, STOP_AT_END, &extra);
    let storage = LocalStorage::new(dir.path().join("out"));

    let output = run_capture(&config, &ReplayConnector, memory_store(), &storage)
        .await
        .unwrap();

    let records = read_stream(&output.uris["inventory.customers"]);
    assert_eq!(records, vec![expected]);
}

/// RAW keeps the normalized key and envelope side by side.
#[tokio::test]
async fn test_capture_raw_format_keeps_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let replay = write_replay(dir.path(), &[insert(5, 6, STREAMING)]);
    let config = capture_config(&replay, STOP_AT_END, "output:\n  format: RAW\n");
    let storage = LocalStorage::new(dir.path().join("out"));

    let output = run_capture(&config, &ReplayConnector, memory_store(), &storage)
        .await
        .unwrap();

    let records = read_stream(&output.uris["inventory.customers"]);
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record["key"], json!({"id": 5}));
    assert_eq!(record["value"]["after"], json!({"id": 5, "a": 6}));
    assert_eq!(record["value"]["source"]["table"], "customers");
    assert_eq!(record["deleted"], false);
}

/// Deletes carry the `before` image; the flag column follows `output.deleted`.
#[rstest]
#[case::flagged("ADD_FIELD", json!({"id": 4, "a": 40, "deleted": true}))]
#[case::unflagged("NULL", json!({"id": 4, "a": 40}))]
#[tokio::test]
async fn test_capture_delete_semantics(#[case] mode: &str, #[case] expected: serde_json::Value) {
    let dir = tempfile::tempdir().unwrap();
    let replay = write_replay(
        dir.path(),
        &[change("inventory", "customers", "d", 4, json!({"id": 4, "a": 40}), STREAMING)],
    );
    let extra = format!("{PLAIN_ROWS}  deleted: {mode}\n");
    let config = capture_config(&replay, STOP_AT_END, &extra);
    let storage = LocalStorage::new(dir.path().join("out"));

    let output = run_capture(&config, &ReplayConnector, memory_store(), &storage)
        .await
        .unwrap();

    assert_eq!(read_stream(&output.uris["inventory.customers"]), vec![expected]);
}

/// Stream names follow `output.split_table`.
#[rstest]
#[case::off("OFF", "data")]
#[case::database("DATABASE", "inventory")]
#[case::table("TABLE", "inventory.customers")]
#[tokio::test]
async fn test_capture_split_table_modes(#[case] split: &str, #[case] stream: &str) {
    let dir = tempfile::tempdir().unwrap();
    let replay = write_replay(dir.path(), &[insert(1, 1, STREAMING)]);
    let extra = format!("output:\n  split_table: {split}\n");
    let config = capture_config(&replay, STOP_AT_END, &extra);
    let storage = LocalStorage::new(dir.path().join("out"));

    let output = run_capture(&config, &ReplayConnector, memory_store(), &storage)
        .await
        .unwrap();

    assert_eq!(output.uris.keys().collect::<Vec<_>>(), [stream]);
}

/// A second capture against the same store resumes after the first and
/// emits only records appended since.
#[tokio::test]
async fn test_capture_resumes_from_persisted_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let replay = write_replay(
        dir.path(),
        &[insert(1, 1, STREAMING), insert(2, 2, STREAMING)],
    );
    let config = capture_config(&replay, STOP_AT_END, PLAIN_ROWS);
    let store = memory_store();

    let first = run_capture(
        &config,
        &ReplayConnector,
        store.clone(),
        &LocalStorage::new(dir.path().join("first")),
    )
    .await
    .unwrap();
    assert_eq!(first.size, 2);
    assert_eq!(stored_position(store.as_ref(), &config), Some(2));

    let idle = run_capture(
        &config,
        &ReplayConnector,
        store.clone(),
        &LocalStorage::new(dir.path().join("idle")),
    )
    .await
    .unwrap();
    assert_eq!(idle.size, 0, "Nothing new should be emitted on resume");
    assert!(idle.uris.is_empty());

    append_replay(&replay, &[insert(3, 3, STREAMING)]);
    let third = run_capture(
        &config,
        &ReplayConnector,
        store.clone(),
        &LocalStorage::new(dir.path().join("third")),
    )
    .await
    .unwrap();
    assert_eq!(third.size, 1);
    assert_eq!(
        read_stream(&third.uris["inventory.customers"]),
        vec![json!({"id": 3, "a": 3, "deleted": false})]
    );
    assert_eq!(stored_position(store.as_ref(), &config), Some(3));
}

/// Delegates to a real store but fails every read once `unreadable` is set.
struct FlakyReads {
    inner: std::sync::Arc<dyn cdcflow_state::CheckpointStore>,
    unreadable: std::sync::atomic::AtomicBool,
}

impl cdcflow_state::CheckpointStore for FlakyReads {
    fn get(&self, key: &str) -> cdcflow_state::Result<Option<Vec<u8>>> {
        if self.unreadable.load(std::sync::atomic::Ordering::Acquire) {
            return Err(cdcflow_state::StateError::LockPoisoned);
        }
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> cdcflow_state::Result<()> {
        self.inner.put(key, value)
    }
}

/// An unreadable checkpoint fails the run instead of replaying from the
/// beginning.
#[tokio::test]
async fn test_unreadable_checkpoint_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let replay = write_replay(
        dir.path(),
        &[insert(1, 1, STREAMING), insert(2, 2, STREAMING)],
    );
    let config = capture_config(&replay, STOP_AT_END, PLAIN_ROWS);
    let store = std::sync::Arc::new(FlakyReads {
        inner: memory_store(),
        unreadable: std::sync::atomic::AtomicBool::new(false),
    });

    let first = run_capture(
        &config,
        &ReplayConnector,
        store.clone(),
        &LocalStorage::new(dir.path().join("first")),
    )
    .await
    .unwrap();
    assert_eq!(first.size, 2);

    store
        .unreadable
        .store(true, std::sync::atomic::Ordering::Release);
    let out = dir.path().join("second");
    let err = run_capture(&config, &ReplayConnector, store.clone(), &LocalStorage::new(&out))
        .await
        .err()
        .expect("restore failure should fail the run");
    assert!(
        matches!(err, cdcflow_engine::CaptureError::CheckpointRead { .. }),
        "unexpected error: {err}"
    );
    assert!(!out.exists(), "Nothing should be emitted");
    assert_eq!(stored_position(store.inner.as_ref(), &config), Some(2));
}

/// `max_records` does not cut a snapshot short.
#[tokio::test]
async fn test_snapshot_ignores_max_records() {
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<_> = (1..=5).map(|id| insert(id, id, SNAPSHOT)).collect();
    let replay = write_replay(dir.path(), &lines);
    let properties = format!("{STOP_AT_END}\n    replay.batch.size: \"1\"");
    let config = capture_config(&replay, &properties, "limits:\n  max_records: 1\n");

    let output = run_capture(
        &config,
        &ReplayConnector,
        memory_store(),
        &LocalStorage::new(dir.path().join("out")),
    )
    .await
    .unwrap();

    assert_eq!(output.size, 5, "All snapshot records should be captured");
}

/// Once streaming, reaching `max_records` ends the run without waiting for
/// the source to go quiet.
#[tokio::test]
async fn test_max_records_ends_streaming_run() {
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<_> = (1..=3).map(|id| insert(id, id, STREAMING)).collect();
    let replay = write_replay(dir.path(), &lines);
    let config = capture_config(&replay, "", "limits:\n  max_records: 2\n  max_wait: 1h\n");

    let output = tokio::time::timeout(
        Duration::from_secs(10),
        run_capture(
            &config,
            &ReplayConnector,
            memory_store(),
            &LocalStorage::new(dir.path().join("out")),
        ),
    )
    .await
    .expect("capture should stop on max_records")
    .unwrap();

    assert!(output.size >= 2, "Expected at least 2 records, got {}", output.size);
}

/// A quiet source ends the run after `max_wait`.
#[tokio::test]
async fn test_max_wait_ends_idle_run() {
    let dir = tempfile::tempdir().unwrap();
    let replay = write_replay(dir.path(), &[]);
    let config = capture_config(&replay, "", "limits:\n  max_wait: 200ms\n");

    let output = tokio::time::timeout(
        Duration::from_secs(10),
        run_capture(
            &config,
            &ReplayConnector,
            memory_store(),
            &LocalStorage::new(dir.path().join("out")),
        ),
    )
    .await
    .expect("capture should stop after max_wait")
    .unwrap();

    assert_eq!(output.size, 0);
    assert!(output.uris.is_empty());
}

/// A batch that fails conversion fails the run. Batches committed before it
/// survive only with `ON_EACH_BATCH`.
#[rstest]
#[case::each_batch("ON_EACH_BATCH", Some(2))]
#[case::on_stop("ON_STOP", None)]
#[tokio::test]
async fn test_failed_run_commit_boundary(#[case] mode: &str, #[case] expected: Option<u64>) {
    let dir = tempfile::tempdir().unwrap();
    let replay = write_replay(
        dir.path(),
        &[
            insert(1, 1, STREAMING),
            insert(2, 2, STREAMING),
            insert(3, 3, STREAMING),
            broken_insert(),
        ],
    );
    let properties = format!("{STOP_AT_END}\n    replay.batch.size: \"2\"");
    let extra = format!("state:\n  offsets_commit_mode: {mode}\n");
    let config = capture_config(&replay, &properties, &extra);
    let store = memory_store();

    let result = run_capture(
        &config,
        &ReplayConnector,
        store.clone(),
        &LocalStorage::new(dir.path().join("out")),
    )
    .await;

    assert!(result.is_err(), "Conversion failure should fail the capture");
    assert_eq!(stored_position(store.as_ref(), &config), expected);
}

/// A realtime stream emits records until stopped, then persists its
/// position with `ON_STOP`.
#[tokio::test]
async fn test_stream_stop_persists_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<_> = (1..=3).map(|id| insert(id, id * 10, STREAMING)).collect();
    let replay = write_replay(dir.path(), &lines);
    let config = capture_config(
        &replay,
        "",
        &format!("{PLAIN_ROWS}state:\n  offsets_commit_mode: ON_STOP\n"),
    );
    let store = memory_store();

    let mut stream = start_stream(&config, &ReplayConnector, store.clone(), 16).unwrap();
    let handle = stream.handle();
    let mut received = Vec::new();
    while received.len() < 3 {
        let output = tokio::time::timeout(Duration::from_secs(10), stream.recv())
            .await
            .expect("record within timeout")
            .expect("stream open");
        received.push(output);
    }
    assert_eq!(stored_position(store.as_ref(), &config), None);

    handle.stop();
    assert!(!handle.is_active());
    let leftover = tokio::time::timeout(Duration::from_secs(10), stream.recv())
        .await
        .expect("stream should close after stop");
    assert!(leftover.is_none());

    let summary = stream.finish().await.unwrap();
    assert_eq!(summary.emitted, 3);
    assert!(summary.undelivered.is_empty());
    assert!(summary.state_offset_key.is_some());
    assert_eq!(stored_position(store.as_ref(), &config), Some(3));

    assert!(received.iter().all(|r| r.stream == "inventory.customers"));
    assert_eq!(
        serde_json::to_value(&received[2].data).unwrap(),
        json!({"id": 3, "a": 30, "deleted": false})
    );
}

/// Records buffered but not yet received when the stream stops are handed
/// back by `finish` rather than dropped.
#[tokio::test]
async fn test_stream_finish_returns_unreceived_records() {
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<_> = (1..=5).map(|id| insert(id, id, STREAMING)).collect();
    let replay = write_replay(dir.path(), &lines);
    let config = capture_config(&replay, "", PLAIN_ROWS);

    let mut stream = start_stream(&config, &ReplayConnector, memory_store(), 16).unwrap();
    let first = tokio::time::timeout(Duration::from_secs(10), stream.recv())
        .await
        .expect("record within timeout")
        .expect("stream open");
    stream.handle().stop();

    let summary = tokio::time::timeout(Duration::from_secs(10), stream.finish())
        .await
        .expect("stream should finish after stop")
        .unwrap();

    assert_eq!(summary.emitted, 1 + summary.undelivered.len() as u64);
    let ids: Vec<_> = std::iter::once(&first)
        .chain(&summary.undelivered)
        .map(|record| serde_json::to_value(&record.data).unwrap()["id"].clone())
        .collect();
    let expected: Vec<_> = (1..=ids.len()).map(|id| json!(id)).collect();
    assert_eq!(ids, expected, "Records come back in emission order");
}

/// The fixture definition parses and validates.
#[test]
fn test_fixture_capture_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/capture.yaml");
    let config = parse_capture(std::path::Path::new(path)).expect("fixture should parse");
    validate_capture(&config).expect("fixture should validate");
    assert_eq!(config.state.task_run.as_deref(), Some("run-42"));
    assert_eq!(config.limits.max_wait, Some(Duration::from_secs(2)));
}
