//! Policy decision passthrough to the Policy Engine.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use super::AppState;

fn default_limit() -> usize {
    500
}

#[derive(Debug, Deserialize)]
pub struct DecisionsParams {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub policy_id: Option<String>,
    pub component: Option<String>,
    pub result: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// GET /api/policy/decisions - forwarded straight to the Policy Engine.
pub async fn get_policy_decisions(
    Query(params): Query<DecisionsParams>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let url = format!("{}/api/v1/policy_decisions", state.config.policy_engine_url);

    let mut qp: Vec<(&str, String)> = vec![("limit", params.limit.to_string())];
    if let Some(v) = &params.start_time {
        qp.push(("start_time", v.clone()));
    }
    if let Some(v) = &params.end_time {
        qp.push(("end_time", v.clone()));
    }
    if let Some(v) = &params.policy_id {
        qp.push(("policy_id", v.clone()));
    }
    if let Some(v) = &params.component {
        qp.push(("component", v.clone()));
    }
    if let Some(v) = &params.result {
        qp.push(("result", v.clone()));
    }

    match state.http.get(&url).query(&qp).send().await {
        Ok(resp) if resp.status().is_success() => {
            let decisions = resp.json::<Value>().await.unwrap_or_else(|_| json!([]));
            Ok(Json(decisions))
        }
        Ok(resp) => {
            warn!("Policy engine returned status {}", resp.status());
            let status = StatusCode::from_u16(resp.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            Err((status, Json(json!([]))))
        }
        Err(e) => {
            error!("Error fetching policy decisions: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string(), "decisions": []})),
            ))
        }
    }
}
