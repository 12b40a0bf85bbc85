//! Event query endpoints with canonical/legacy parameter compatibility.

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::storage::EventQuery;

fn default_limit() -> usize {
    100
}

fn default_summary_limit() -> usize {
    5000
}

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub source_component: Option<String>,
    /// Legacy alias for `source_component`.
    pub component: Option<String>,
    pub event_type: Option<String>,
    pub event_level: Option<String>,
    /// Legacy alias for `event_level`.
    pub level: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    pub since_id: Option<i64>,
}

impl EventsParams {
    fn source_component(&self) -> Option<String> {
        self.source_component.clone().or_else(|| self.component.clone())
    }

    fn level(&self) -> Option<String> {
        self.event_level.clone().or_else(|| self.level.clone())
    }
}

/// GET /api/events
pub async fn get_events(
    Query(params): Query<EventsParams>,
    State(state): State<AppState>,
) -> Json<Value> {
    let source_component = params.source_component();
    let level = params.level();

    let events = state.storage.load_events(&EventQuery {
        start_time: params.start_time.clone(),
        end_time: params.end_time.clone(),
        source_component: source_component.clone(),
        event_type: params.event_type.clone(),
        level: level.clone(),
        since_id: params.since_id,
        limit: params.limit,
        offset: params.offset,
        sort_desc: true,
    });
    let total = state.storage.count_events(
        source_component.as_deref(),
        params.event_type.as_deref(),
        level.as_deref(),
    );

    Json(json!({
        "events": events,
        "total": total,
        "limit": params.limit,
        "offset": params.offset,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SummaryParams {
    pub source_component: Option<String>,
    pub component: Option<String>,
    pub event_type: Option<String>,
    pub event_level: Option<String>,
    pub level: Option<String>,
    #[serde(default = "default_summary_limit")]
    pub summary_limit: usize,
}

/// GET /api/events/summary - counts by component and level; when the total
/// exceeds the scan cap the counts are extrapolated proportionally.
pub async fn get_events_summary(
    Query(params): Query<SummaryParams>,
    State(state): State<AppState>,
) -> Json<Value> {
    let source_component = params.source_component.clone().or(params.component.clone());
    let level = params.event_level.clone().or(params.level.clone());

    let events = state.storage.load_events(&EventQuery {
        source_component: source_component.clone(),
        event_type: params.event_type.clone(),
        level: level.clone(),
        limit: params.summary_limit,
        sort_desc: true,
        ..Default::default()
    });
    let total = state.storage.count_events(
        source_component.as_deref(),
        params.event_type.as_deref(),
        level.as_deref(),
    );

    let (by_component, by_level) = count_events(&events);

    // If we sampled, adjust the counts proportionally.
    let scale = if !events.is_empty() && total > events.len() as i64 {
        total as f64 / events.len() as f64
    } else {
        1.0
    };
    let scaled = |counts: &HashMap<String, usize>| -> Value {
        counts
            .iter()
            .map(|(k, v)| (k.clone(), json!((*v as f64 * scale) as i64)))
            .collect::<serde_json::Map<_, _>>()
            .into()
    };

    Json(json!({
        "by_component": scaled(&by_component),
        "by_source_component": scaled(&by_component),
        "by_level": scaled(&by_level),
        "by_event_level": scaled(&by_level),
        "total": total,
    }))
}

fn count_events(events: &[Value]) -> (HashMap<String, usize>, HashMap<String, usize>) {
    let mut by_component: HashMap<String, usize> = HashMap::new();
    let mut by_level: HashMap<String, usize> = HashMap::new();
    for event in events {
        let component = event
            .get("component")
            .or_else(|| event.get("source_component"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        *by_component.entry(component.to_string()).or_default() += 1;

        let level = event
            .get("level")
            .or_else(|| event.get("event_level"))
            .and_then(Value::as_str)
            .unwrap_or("INFO");
        *by_level.entry(level.to_string()).or_default() += 1;
    }
    (by_component, by_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_groups_by_component_and_level() {
        let events = vec![
            json!({"component": "FL_SERVER", "level": "INFO"}),
            json!({"component": "FL_SERVER", "level": "WARNING"}),
            json!({"source_component": "COLLECTOR", "event_level": "INFO"}),
        ];
        let (by_component, by_level) = count_events(&events);
        assert_eq!(by_component["FL_SERVER"], 2);
        assert_eq!(by_component["COLLECTOR"], 1);
        assert_eq!(by_level["INFO"], 2);
        assert_eq!(by_level["WARNING"], 1);
    }
}
