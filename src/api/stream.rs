//! WebSocket streaming of metric updates.
//!
//! Clients connect and send a `subscribe` message:
//! `{"action": "subscribe", "type": "fl_server", "interval_ms": 5000}`.
//! The interval is clamped to 1000-30000 ms and one emitter pushes
//! `metrics_update` frames until the client unsubscribes or disconnects.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Json, Response},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use super::AppState;
use crate::storage::MetricQuery;

const MIN_INTERVAL_MS: u64 = 1000;
const MAX_INTERVAL_MS: u64 = 30_000;

/// GET /api/metrics/stream - describes the streaming endpoint.
pub async fn stream_info() -> Json<Value> {
    Json(json!({
        "status": "available",
        "websocket_endpoint": "/api/metrics/stream/ws",
        "usage": "Connect and send {\"action\": \"subscribe\", \"type\": \"fl_server\", \"interval_ms\": 5000}",
        "events": {
            "subscribe": "Start receiving metric updates at the requested cadence",
            "unsubscribe": "Stop the updates without disconnecting",
            "metrics_update": "Pushed whenever the emitter ticks",
        },
    }))
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug)]
struct Subscription {
    metric_type: Option<String>,
    interval_ms: u64,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("Client connected to metrics stream");
    let (mut sender, mut receiver) = socket.split();

    let mut subscription: Option<Subscription> = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(MAX_INTERVAL_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            message = receiver.next() => {
                let Some(Ok(message)) = message else {
                    break; // disconnect or protocol error
                };
                match message {
                    Message::Text(text) => {
                        let Ok(request) = serde_json::from_str::<Value>(&text) else {
                            let _ = sender
                                .send(Message::Text(
                                    json!({"event": "error", "message": "invalid JSON"}).to_string(),
                                ))
                                .await;
                            continue;
                        };
                        match request.get("action").and_then(Value::as_str) {
                            Some("subscribe") | None => {
                                let interval_ms = request
                                    .get("interval_ms")
                                    .or_else(|| request.get("interval"))
                                    .and_then(Value::as_u64)
                                    .unwrap_or(5000)
                                    .clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);
                                let metric_type = request
                                    .get("type")
                                    .and_then(Value::as_str)
                                    .filter(|t| *t != "all")
                                    .map(str::to_string);

                                debug!(
                                    "Stream subscription: type={:?}, interval={}ms",
                                    metric_type, interval_ms
                                );
                                ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                                ticker.set_missed_tick_behavior(
                                    tokio::time::MissedTickBehavior::Skip,
                                );
                                subscription = Some(Subscription { metric_type, interval_ms });
                                let ack = json!({
                                    "event": "subscribed",
                                    "type": request.get("type").cloned().unwrap_or(json!("all")),
                                    "interval_ms": interval_ms,
                                });
                                if sender.send(Message::Text(ack.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Some("unsubscribe") => {
                                subscription = None;
                                let _ = sender
                                    .send(Message::Text(json!({"event": "unsubscribed"}).to_string()))
                                    .await;
                            }
                            Some(other) => {
                                let _ = sender
                                    .send(Message::Text(
                                        json!({"event": "error", "message": format!("unknown action '{}'", other)})
                                            .to_string(),
                                    ))
                                    .await;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    Message::Ping(payload) => {
                        let _ = sender.send(Message::Pong(payload)).await;
                    }
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                let Some(sub) = &subscription else { continue };
                let latest = state.storage.load_metrics(&MetricQuery {
                    type_filter: sub.metric_type.clone(),
                    limit: 1,
                    sort_desc: true,
                    ..Default::default()
                });
                if let Some(row) = latest.first() {
                    let frame = json!({
                        "event": "metrics_update",
                        "timestamp": Utc::now().to_rfc3339(),
                        "type": sub.metric_type.clone().unwrap_or_else(|| "all".into()),
                        "interval_ms": sub.interval_ms,
                        "data": row.to_json(),
                    });
                    if sender.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    info!("Client disconnected from metrics stream");
}
