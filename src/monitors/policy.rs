//! Policy monitor: periodic decision and metric pulls from the Policy Engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::storage::MetricsStorage;

pub struct PolicyMonitor {
    client: Client,
    base_url: String,
    storage: Arc<MetricsStorage>,
    /// Cursor for `/api/v1/policy_decisions`; advances only after a
    /// successful batch so a failed poll re-fetches at the next tick.
    last_decision_timestamp: Mutex<f64>,
}

impl PolicyMonitor {
    pub fn new(base_url: &str, storage: Arc<MetricsStorage>) -> anyhow::Result<Self> {
        anyhow::ensure!(!base_url.is_empty(), "Policy Engine URL cannot be empty");
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build policy monitor client: {}", e))?;
        info!("Policy Monitor initialized for URL: {}", base_url);
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            storage,
            // Start one hour back so a restart backfills recent decisions.
            last_decision_timestamp: Mutex::new(Utc::now().timestamp() as f64 - 3600.0),
        })
    }

    /// Run all three collection jobs; returns whether the primary metrics
    /// fetch succeeded so the scheduler can record a degraded state.
    pub async fn collect_metrics(&self) -> bool {
        let ok = self.collect_legacy_metrics().await;
        self.collect_policy_decisions().await;
        self.collect_policy_metrics().await;
        ok
    }

    async fn collect_legacy_metrics(&self) -> bool {
        let url = format!("{}/metrics", self.base_url);
        debug!("Attempting to collect legacy metrics from {}", url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(metrics) if !metrics.is_null() => {
                    self.storage.store_metric("policy_engine", &metrics);
                    info!("Successfully collected legacy metrics from Policy Engine");
                    true
                }
                Ok(_) => {
                    warn!("Received empty legacy metrics data from Policy Engine");
                    false
                }
                Err(e) => {
                    error!("Error decoding JSON response from Policy Engine: {}", e);
                    false
                }
            },
            Ok(resp) => {
                error!("Policy Engine /metrics returned {}", resp.status());
                false
            }
            Err(e) => {
                error!("Error connecting to Policy Engine at {}: {}", url, e);
                false
            }
        }
    }

    async fn collect_policy_decisions(&self) {
        let url = format!("{}/api/v1/policy_decisions", self.base_url);
        let start_time = *self.last_decision_timestamp.lock();
        debug!("Attempting to collect policy decisions from {}", url);

        let resp = match self
            .client
            .get(&url)
            .query(&[("start_time", start_time.to_string()), ("limit", "1000".to_string())])
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                error!("Policy Engine decisions endpoint returned {}", resp.status());
                return;
            }
            Err(e) => {
                error!("Error connecting to Policy Engine decisions endpoint: {}", e);
                return;
            }
        };

        let decisions: Vec<Value> = match resp.json::<Value>().await {
            Ok(Value::Array(list)) => list,
            Ok(other) => other
                .get("decisions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            Err(e) => {
                error!("Error decoding JSON response from Policy Engine decisions: {}", e);
                return;
            }
        };

        if decisions.is_empty() {
            debug!("No new policy decisions found");
            return;
        }

        let mut latest = start_time;
        for decision in &decisions {
            self.storage.store_metric("policy_decisions", decision);
            if let Some(ts) = decision.get("timestamp").and_then(Value::as_f64) {
                latest = latest.max(ts);
            }
        }
        *self.last_decision_timestamp.lock() = latest;
        info!("Successfully collected {} policy decisions from Policy Engine", decisions.len());
    }

    /// Pull the last 24 hours of time-bucketed policy metrics and store the
    /// two shapes the dashboards chart from.
    async fn collect_policy_metrics(&self) {
        let url = format!("{}/api/v1/policy_metrics", self.base_url);
        let end_time = Utc::now().timestamp() as f64;
        let start_time = end_time - 24.0 * 3600.0;
        debug!("Attempting to collect policy metrics from {}", url);

        let resp = match self
            .client
            .get(&url)
            .query(&[("start_time", start_time.to_string()), ("end_time", end_time.to_string())])
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                error!("Policy Engine policy_metrics returned {}", resp.status());
                return;
            }
            Err(e) => {
                error!("Error collecting policy metrics: {}", e);
                return;
            }
        };

        let body = match resp.json::<Value>().await {
            Ok(body) => body,
            Err(e) => {
                error!("Error decoding policy metrics response: {}", e);
                return;
            }
        };

        let Some(buckets) = body.get("metrics").and_then(Value::as_array) else {
            warn!("Invalid policy metrics response structure from Policy Engine");
            return;
        };
        if buckets.is_empty() {
            warn!("No metrics array found in policy engine response");
            return;
        }

        for bucket in buckets {
            let timestamp = bucket
                .get("timestamp")
                .cloned()
                .unwrap_or_else(|| json!(Utc::now().timestamp() as f64));
            let record = json!({
                "timestamp": timestamp,
                "iso_time": bucket.get("iso_time").cloned().unwrap_or(Value::Null),
                "allowed_count": bucket.get("allowed_count").cloned().unwrap_or(json!(0)),
                "denied_count": bucket.get("denied_count").cloned().unwrap_or(json!(0)),
                "total_evaluations": bucket.get("total_evaluations").cloned().unwrap_or(json!(0)),
                "denial_rate": bucket.get("denial_rate").cloned().unwrap_or(json!(0.0)),
                "success_rate": bucket.get("success_rate").cloned().unwrap_or(json!(100.0)),
                "avg_evaluation_time_ms": bucket.get("avg_evaluation_time_ms").cloned().unwrap_or(json!(0.0)),
                "policies_active": bucket.get("policies_active").cloned().unwrap_or(json!(0)),
                "unique_requesters": bucket.get("unique_requesters").cloned().unwrap_or(json!(0)),
            });
            self.storage.store_metric("policy_count", &record);

            let decision_record = json!({
                "timestamp": record["timestamp"],
                "iso_time": record["iso_time"],
                "allowed": record["allowed_count"],
                "denied": record["denied_count"],
                "total": record["total_evaluations"],
                "denial_rate": record["denial_rate"],
            });
            self.storage.store_metric("decision_count", &decision_record);
        }

        info!("Successfully stored {} policy metrics time-series points", buckets.len());
    }
}
