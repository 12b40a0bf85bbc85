//! Typed client for the FL server's HTTP surface.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::models::FlRound;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsResponse {
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default)]
    pub last_event_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoundsResponse {
    #[serde(default)]
    pub rounds: Vec<FlRound>,
    #[serde(default)]
    pub latest_round: u64,
    #[serde(default)]
    pub total_rounds: u64,
}

#[derive(Clone)]
pub struct FlServerClient {
    client: Client,
    base_url: String,
}

impl FlServerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to build FL server client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Quick health probe; any transport or status failure reads as down.
    pub async fn health(&self) -> bool {
        match self
            .client
            .get(self.url("/health"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Incremental event fetch; `since_event_id` resumes from the cursor.
    pub async fn get_events(
        &self,
        since_event_id: Option<&str>,
        limit: usize,
    ) -> Result<EventsResponse> {
        let mut qp: Vec<(String, String)> = vec![("limit".into(), limit.to_string())];
        if let Some(id) = since_event_id {
            qp.push(("since_event_id".into(), id.to_string()));
        }
        let resp = self
            .client
            .get(self.url("/events"))
            .query(&qp)
            .send()
            .await
            .context("GET /events failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("GET /events returned {}", resp.status());
        }
        resp.json::<EventsResponse>()
            .await
            .context("Failed to parse FL events response")
    }

    pub async fn get_rounds_latest(&self, limit: usize) -> Result<RoundsResponse> {
        let resp = self
            .client
            .get(self.url("/rounds/latest"))
            .query(&[("limit", limit.to_string())])
            .send()
            .await
            .context("GET /rounds/latest failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("GET /rounds/latest returned {}", resp.status());
        }
        resp.json::<RoundsResponse>()
            .await
            .context("Failed to parse FL rounds/latest response")
    }

    pub async fn get_rounds_range(
        &self,
        start_round: u64,
        end_round: u64,
        limit: usize,
    ) -> Result<Vec<FlRound>> {
        let qp = [
            ("start_round", start_round.to_string()),
            ("end_round", end_round.to_string()),
            ("limit", limit.to_string()),
        ];
        let resp = self
            .client
            .get(self.url("/rounds"))
            .query(&qp)
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .context("GET /rounds failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("GET /rounds returned {}", resp.status());
        }
        let rounds: RoundsResponse = resp
            .json()
            .await
            .context("Failed to parse FL rounds response")?;
        Ok(rounds.rounds)
    }

    /// Raw `/rounds` passthrough for the query API's forwarded filters.
    pub async fn get_rounds_raw(&self, params: &[(String, String)]) -> Result<Value> {
        let resp = self
            .client
            .get(self.url("/rounds"))
            .query(params)
            .send()
            .await
            .context("GET /rounds failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("GET /rounds returned {}", resp.status());
        }
        resp.json::<Value>()
            .await
            .context("Failed to parse FL rounds response")
    }

    /// Server-wide status (paused, stopped_by_policy, connected clients).
    pub async fn get_status(&self) -> Result<Value> {
        let resp = self
            .client
            .get(self.url("/status"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .context("GET /status failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("GET /status returned {}", resp.status());
        }
        resp.json::<Value>().await.context("Failed to parse FL status response")
    }

    /// Server configuration, including `max_rounds`.
    pub async fn get_metrics(&self) -> Result<Value> {
        let resp = self
            .client
            .get(self.url("/metrics"))
            .send()
            .await
            .context("GET /metrics failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("GET /metrics returned {}", resp.status());
        }
        resp.json::<Value>().await.context("Failed to parse FL metrics response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rounds_response_tolerates_sloppy_numbers() {
        let resp: RoundsResponse = serde_json::from_value(json!({
            "latest_round": 3,
            "rounds": [{
                "round": 3,
                "accuracy": 0.842,
                "loss": 0.055,
                "clients": "4",
                "training_duration": 7.1,
                "model_size_mb": "1.73",
                "timestamp": "2025-01-01T00:00:00Z"
            }]
        }))
        .unwrap();
        assert_eq!(resp.latest_round, 3);
        assert_eq!(resp.rounds[0].round, 3);
        assert_eq!(resp.rounds[0].accuracy, 0.842);
        assert_eq!(crate::models::coerce_i64(&resp.rounds[0].clients, 0), 4);
        assert_eq!(crate::models::coerce_f64(&resp.rounds[0].model_size_mb, 0.0), 1.73);
    }

    #[test]
    fn events_response_defaults() {
        let resp: EventsResponse = serde_json::from_value(json!({})).unwrap();
        assert!(resp.events.is_empty());
        assert!(resp.last_event_id.is_none());
    }
}
