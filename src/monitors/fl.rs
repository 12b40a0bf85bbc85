//! Event-based FL monitor.
//!
//! Ingestion is incremental and idempotent: the event cursor and the round
//! watermark only advance after a batch stores successfully, and
//! `known_rounds` guarantees each round is written exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clients::fl_server::FlServerClient;
use crate::models::{coerce_f64, coerce_i64, normalize_timestamp, Event, EventLevel, FlRound};
use crate::storage::MetricsStorage;

const EVENT_BATCH_LIMIT: usize = 100;

#[derive(Debug, Default)]
struct FlState {
    last_event_id: Option<String>,
    known_rounds: HashSet<u64>,
    last_round_check: u64,
    training_complete: bool,
    error_count: u32,
    running: bool,
}

pub struct FlMonitor {
    client: FlServerClient,
    storage: Arc<MetricsStorage>,
    collection_interval: Duration,
    max_errors: u32,
    training_mode: String,
    state: Mutex<FlState>,
}

impl FlMonitor {
    pub fn new(
        client: FlServerClient,
        storage: Arc<MetricsStorage>,
        collection_interval_sec: u64,
        training_mode: &str,
    ) -> Arc<Self> {
        let fast = matches!(training_mode, "mock" | "development");
        // Event-based collection: short checks in dev, bounded in production.
        let interval = if fast {
            collection_interval_sec.min(5)
        } else {
            collection_interval_sec.max(10)
        };
        let max_errors = if fast { 10 } else { 5 };
        info!(
            "FL Monitor configured for {} mode with {}s event check interval",
            training_mode, interval
        );
        Arc::new(Self {
            client,
            storage,
            collection_interval: Duration::from_secs(interval),
            max_errors,
            training_mode: training_mode.to_string(),
            state: Mutex::new(FlState::default()),
        })
    }

    pub fn client(&self) -> &FlServerClient {
        &self.client
    }

    /// Main monitoring loop; owns its worker until shutdown or too many
    /// consecutive failures.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("FL Monitor: Starting event-based monitoring loop");
        self.state.lock().running = true;
        let mut ticker = tokio::time::interval(self.collection_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.tick().await {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.state.lock().running = false;
        info!("FL Monitor: Monitoring loop ended");
    }

    /// One iteration. Returns false when the error budget is exhausted.
    async fn tick(&self) -> bool {
        if !self.client.health().await {
            debug!("FL server not available, skipping this cycle");
            return true;
        }

        let events = self.collect_fl_events().await;
        let rounds = self.collect_fl_rounds().await;

        match (events, rounds) {
            (Ok(events_stored), Ok(rounds_stored)) => {
                self.state.lock().error_count = 0;
                // A fresh fl_server snapshot keeps the latest-state queries
                // and the rounds-consolidation fallbacks supplied.
                let snapshot = self.collect_metrics().await;
                self.storage.store_metric("fl_server", &snapshot);
                debug!(
                    "FL Monitor: Collected {} events, {} rounds",
                    events_stored, rounds_stored
                );
                true
            }
            (events, rounds) => {
                if let Err(e) = events {
                    error!("FL Monitor: Error collecting FL events: {:#}", e);
                }
                if let Err(e) = rounds {
                    error!("FL Monitor: Error collecting FL rounds: {:#}", e);
                }
                let mut state = self.state.lock();
                state.error_count += 1;
                if state.error_count >= self.max_errors {
                    error!(
                        "FL Monitor: Too many errors ({}), stopping monitoring",
                        state.error_count
                    );
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Fetch events past the cursor, mirror the training-relevant ones as
    /// metrics, then advance the cursor.
    async fn collect_fl_events(&self) -> Result<usize> {
        let since = self.state.lock().last_event_id.clone();
        let resp = self.client.get_events(since.as_deref(), EVENT_BATCH_LIMIT).await?;

        let mut stored = 0usize;
        for event in &resp.events {
            self.process_fl_event(event);
            stored += 1;
        }

        if let Some(last_event_id) = resp.last_event_id {
            self.state.lock().last_event_id = Some(last_event_id);
        }
        debug!("FL Monitor: Processed {}/{} FL events", stored, resp.events.len());
        Ok(stored)
    }

    fn process_fl_event(&self, event: &Value) {
        let event_type = event.get("event_type").and_then(Value::as_str).unwrap_or("");
        let details = event.get("details").cloned().unwrap_or_else(|| json!({}));
        let timestamp = event
            .get("timestamp")
            .map(normalize_timestamp)
            .unwrap_or_else(|| Utc::now().to_rfc3339());

        self.storage.store_event(&Event {
            event_id: event
                .get("event_id")
                .or_else(|| event.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            timestamp: timestamp.clone(),
            source_component: "FL_SERVER".to_string(),
            event_type: event_type.to_string(),
            event_level: EventLevel::Info,
            message: format!("{}", event_type),
            details: details.clone(),
        });

        let round_num = details.get("round_number").and_then(Value::as_u64).unwrap_or(0);
        match event_type {
            "ROUND_END" if round_num > 0 => {
                let round_metrics = json!({
                    "timestamp": timestamp,
                    "round": round_num,
                    "status": "complete",
                    "event_source": "fl_server_event",
                    "global_metrics": details.get("global_metrics").cloned().unwrap_or_else(|| json!({})),
                    "model_version": details
                        .get("model_version")
                        .cloned()
                        .unwrap_or_else(|| json!(format!("round_{}", round_num))),
                });
                self.storage
                    .store_metric(&format!("fl_round_{}_event", round_num), &round_metrics);
                debug!("FL Monitor: Stored round {} completion event", round_num);
            }
            "TRAINING_COMPLETE" => {
                self.state.lock().training_complete = true;
                let completion = json!({
                    "timestamp": timestamp,
                    "status": "training_complete",
                    "event_source": "fl_server_event",
                    "total_rounds": details.get("total_rounds").cloned().unwrap_or(json!(0)),
                    "total_duration_sec": details.get("total_duration_sec").cloned().unwrap_or(json!(0)),
                    "final_metrics": details.get("final_metrics").cloned().unwrap_or_else(|| json!({})),
                });
                self.storage.store_metric("fl_training_completion", &completion);
                info!("FL Monitor: Training completion detected via events");
            }
            _ => {}
        }
    }

    /// Fetch rounds past the watermark and store each exactly once.
    async fn collect_fl_rounds(&self) -> Result<usize> {
        let latest = match self.client.get_rounds_latest(1).await {
            Ok(latest) => latest,
            Err(e) => {
                // The FL server may simply have no rounds yet.
                debug!("FL rounds/latest unavailable: {:#}", e);
                return Ok(0);
            }
        };

        let last_round_check = self.state.lock().last_round_check;
        if latest.rounds.is_empty() || latest.latest_round <= last_round_check {
            debug!(
                "FL Monitor: No new rounds (latest: {}, last checked: {})",
                latest.latest_round, last_round_check
            );
            return Ok(0);
        }

        let start_round = (last_round_check + 1).max(1);
        let limit = (latest.latest_round - start_round + 1) as usize;
        let rounds = self
            .client
            .get_rounds_range(start_round, latest.latest_round, limit)
            .await?;

        let mut stored = 0usize;
        for round in &rounds {
            let already_known = {
                let state = self.state.lock();
                state.known_rounds.contains(&round.round)
            };
            if already_known || round.round == 0 {
                continue;
            }
            let training_complete = self.state.lock().training_complete;
            let processed = process_round(round, training_complete, latest.latest_round);
            self.storage.store_metric(&format!("fl_round_{}", round.round), &processed);
            self.state.lock().known_rounds.insert(round.round);
            stored += 1;
        }

        self.state.lock().last_round_check = latest.latest_round;
        debug!(
            "FL Monitor: Processed {} new rounds (latest: {})",
            stored, latest.latest_round
        );
        Ok(stored)
    }

    /// Synchronous snapshot of the current FL state for API requests.
    pub async fn collect_metrics(&self) -> Value {
        if !self.client.health().await {
            return json!({
                "status": "unavailable",
                "timestamp": unix_now(),
                "error": "FL server health check failed",
                "data_source": "fl_monitor_event_based",
            });
        }

        let server_status = self.client.get_status().await.unwrap_or_else(|_| json!({}));
        let training_complete = self.state.lock().training_complete;

        let latest = match self.client.get_rounds_latest(5).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!("FL Monitor: rounds endpoint failed during snapshot: {:#}", e);
                return json!({
                    "status": "available",
                    "timestamp": unix_now(),
                    "current_round": 0,
                    "training_complete": false,
                    "data_state": "initializing",
                    "data_source": "fl_monitor_event_based",
                    "server_status_details": server_status,
                });
            }
        };

        let fl_status = if server_status
            .get("training_stopped_by_policy")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            "stopped_by_policy".to_string()
        } else if server_status
            .get("training_paused")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            "paused".to_string()
        } else if training_complete {
            "training_complete".to_string()
        } else {
            server_status
                .get("server_status")
                .and_then(Value::as_str)
                .unwrap_or("training")
                .to_string()
        };

        let status_clients = server_status.get("connected_clients").cloned();
        let mut current = json!({
            "status": fl_status,
            "timestamp": unix_now(),
            "current_round": latest.latest_round,
            "connected_clients": 0,
            "training_complete": training_complete,
            "data_state": fl_status,
            "data_source": "fl_monitor_event_based",
            "source_component": "FL_SERVER",
            "rounds_history": latest.rounds,
            "server_status_details": server_status,
        });

        if let Some(last) = latest.rounds.first() {
            let clients = coerce_i64(&last.clients, 0);
            current["accuracy"] = json!(last.accuracy);
            current["loss"] = json!(last.loss);
            current["connected_clients"] = json!(clients);
            current["model_size_mb"] = json!(coerce_f64(&last.model_size_mb, 0.0));
            current["last_round_metrics"] = json!({
                "round": last.round,
                "accuracy": last.accuracy,
                "loss": last.loss,
                "training_duration": coerce_f64(&last.training_duration, 0.0),
                "timestamp": last.timestamp,
            });
        } else if let Some(clients) = status_clients {
            current["connected_clients"] = clients;
        }

        if latest.rounds.len() > 1 {
            let accuracies: Vec<f64> = latest
                .rounds
                .iter()
                .map(|r| r.accuracy)
                .filter(|a| *a > 0.0)
                .collect();
            if !accuracies.is_empty() {
                current["training_stats"] = json!({
                    "total_completed_rounds": accuracies.len(),
                    "best_accuracy": accuracies.iter().cloned().fold(f64::MIN, f64::max),
                    "latest_accuracy": accuracies[0],
                    "average_accuracy": accuracies.iter().sum::<f64>() / accuracies.len() as f64,
                });
            }
        }

        current
    }

    pub fn get_monitoring_status(&self) -> Value {
        let state = self.state.lock();
        json!({
            "running": state.running,
            "training_mode": self.training_mode,
            "collection_interval": self.collection_interval.as_secs(),
            "error_count": state.error_count,
            "last_event_id": state.last_event_id,
            "known_rounds_count": state.known_rounds.len(),
            "last_round_check": state.last_round_check,
            "training_complete": state.training_complete,
            "fl_server_url": self.client.base_url(),
        })
    }
}

/// Coerce a raw round into the stored `fl_round_<N>` payload. Only the
/// current round shows as `training`, and only while training is live.
pub fn process_round(round: &FlRound, training_complete: bool, latest_round: u64) -> Value {
    let model_size_mb = {
        let parsed = coerce_f64(&round.model_size_mb, f64::NAN);
        if parsed.is_nan() {
            warn!(
                "FL Monitor: Invalid model_size_mb value '{}' for round {}, using 0.0",
                round.model_size_mb, round.round
            );
            0.0
        } else {
            parsed
        }
    };
    let training_duration = coerce_f64(&round.training_duration, 0.0);
    let clients = coerce_i64(&round.clients, 0);

    let status = if !training_complete && round.round == latest_round {
        "training"
    } else {
        "complete"
    };

    json!({
        "timestamp": round
            .timestamp
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339()),
        "round": round.round,
        "status": status,
        "accuracy": round.accuracy,
        "loss": round.loss,
        "training_duration": training_duration,
        "model_size_mb": model_size_mb,
        "clients": clients,
        "clients_connected": clients,
        "data_source": "fl_server_rounds",
        "raw_metrics": round.raw_metrics,
        "training_complete": training_complete,
    })
}

fn unix_now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round(n: u64) -> FlRound {
        serde_json::from_value(json!({
            "round": n,
            "accuracy": 0.842,
            "loss": 0.055,
            "clients": 4,
            "training_duration": 7.1,
            "model_size_mb": 1.73,
            "timestamp": "2025-01-01T00:00:00Z",
        }))
        .unwrap()
    }

    #[test]
    fn current_round_is_training_until_complete() {
        let processed = process_round(&round(3), false, 3);
        assert_eq!(processed["status"], "training");

        let processed = process_round(&round(2), false, 3);
        assert_eq!(processed["status"], "complete");

        let processed = process_round(&round(3), true, 3);
        assert_eq!(processed["status"], "complete");
    }

    #[test]
    fn processed_round_carries_coerced_numbers() {
        let mut r = round(3);
        r.model_size_mb = json!("1.73");
        r.clients = json!("4");
        let processed = process_round(&r, false, 5);
        assert_eq!(processed["model_size_mb"], 1.73);
        assert_eq!(processed["clients"], 4);
        assert_eq!(processed["clients_connected"], 4);
        assert_eq!(processed["accuracy"], 0.842);
    }

    #[test]
    fn garbage_model_size_defaults_to_zero() {
        let mut r = round(1);
        r.model_size_mb = json!("huge");
        let processed = process_round(&r, false, 1);
        assert_eq!(processed["model_size_mb"], 0.0);
    }
}
