//! Integration tests for the metrics storage pipeline.
//!
//! These exercise the same write/read paths the monitors and the API use,
//! against a throwaway SQLite database per test.

use fedmon::models::{Event, EventLevel};
use fedmon::storage::{EventQuery, MetricQuery, MetricsStorage};
use serde_json::json;

fn open_storage(dir: &tempfile::TempDir) -> MetricsStorage {
    MetricsStorage::new(dir.path().to_str().unwrap(), 14, 7, 12).expect("storage init")
}

#[test]
fn fl_round_ingest_populates_metrics_and_summary() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir);

    // The shape the FL monitor writes after one tick.
    storage.store_metric(
        "fl_round_3",
        &json!({
            "timestamp": "2025-01-01T00:00:00Z",
            "round": 3,
            "status": "complete",
            "accuracy": 0.842,
            "loss": 0.055,
            "training_duration": 7.1,
            "model_size_mb": 1.73,
            "clients": 4,
            "clients_connected": 4,
            "data_source": "fl_server_rounds",
        }),
    );

    let rows = storage.load_metrics(&MetricQuery {
        type_filter: Some("fl_round_3".into()),
        limit: 10,
        sort_desc: true,
        ..Default::default()
    });
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].data["accuracy"], 0.842);
    assert_eq!(rows[0].data["loss"], 0.055);

    let summary = storage.get_fl_summary_fast(100);
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0]["round"], 3);
    assert_eq!(summary[0]["accuracy"], 0.842);
    assert_eq!(summary[0]["loss"], 0.055);
    assert_eq!(summary[0]["clients_count"], 4);
    assert_eq!(summary[0]["model_size_mb"], 1.73);
}

#[test]
fn replayed_round_batches_stay_single_rowed_in_summary() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir);

    for _ in 0..3 {
        storage.store_metric("fl_round_5", &json!({"accuracy": 0.7, "loss": 0.2, "clients": 3}));
    }
    storage.cleanup_duplicate_rounds();

    let summary = storage.get_fl_summary_fast(100);
    assert_eq!(summary.len(), 1);

    let rows = storage.load_metrics(&MetricQuery {
        type_prefix: Some("fl_round_".into()),
        limit: 100,
        ..Default::default()
    });
    assert_eq!(rows.len(), 1);
}

#[test]
fn metric_filters_compose() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir);

    storage.store_metric("network", &json!({"status": "ok", "source_component": "NETWORK"}));
    storage.store_metric("policy_engine", &json!({"status": "ok", "source_component": "POLICY_ENGINE"}));
    storage.store_metric("network", &json!({"status": "ok", "source_component": "NETWORK"}));

    assert_eq!(storage.count_metrics(Some("network"), None), 2);
    assert_eq!(storage.count_metrics(None, Some("POLICY_ENGINE")), 1);
    assert_eq!(storage.count_metrics(None, None), 3);

    let rows = storage.load_metrics(&MetricQuery {
        type_filter: Some("network".into()),
        source_component: Some("NETWORK".into()),
        limit: 10,
        sort_desc: true,
        ..Default::default()
    });
    assert_eq!(rows.len(), 2);
}

#[test]
fn events_expose_both_canonical_and_legacy_names() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir);

    storage.store_event(&Event::new(
        "SDN_CONTROLLER",
        "TOPOLOGY_SNAPSHOT",
        EventLevel::Info,
        "SDN Topology: 2 switches, 1 links, 3 hosts".into(),
        json!({"switches": ["0000000000000001", "0000000000000002"]}),
    ));

    let events = storage.load_events(&EventQuery { limit: 10, sort_desc: true, ..Default::default() });
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event["component"], event["source_component"]);
    assert_eq!(event["type"], event["event_type"]);
    assert_eq!(event["level"], event["event_level"]);
    assert_eq!(event["source_component"], "SDN_CONTROLLER");
    assert_eq!(event["event_level"], "INFO");
}

#[test]
fn latest_fl_metrics_recovers_accuracy_from_summary() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir);

    storage.store_metric("fl_round_9", &json!({"accuracy": 0.91, "loss": 0.04}));
    storage.store_metric(
        "fl_server",
        &json!({"status": "training", "current_round": 9, "connected_clients": 4}),
    );

    let latest = storage.get_latest_fl_metrics().expect("latest snapshot");
    assert_eq!(latest["round"], 9);
    assert_eq!(latest["accuracy"], 0.91);
    assert_eq!(latest["status"], "training");
}

#[test]
fn cleanup_runs_without_disturbing_fresh_data() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir);

    storage.store_metric("fl_round_1", &json!({"accuracy": 0.5, "loss": 0.4}));
    storage.store_event(&Event::new(
        "COLLECTOR",
        "COLLECTOR_START",
        EventLevel::Info,
        "COLLECTOR_START".into(),
        json!({}),
    ));

    storage.cleanup();

    assert_eq!(storage.count_metrics(None, None), 1);
    assert_eq!(storage.count_events(None, None, None), 1);
    assert_eq!(storage.get_fl_summary_fast(10).len(), 1);
}
