//! SQLite-backed time-series storage for collected metrics and events.
//!
//! Key choices:
//! - WAL mode for concurrent reads during writes
//! - Prepared statement caching
//! - Fast-path columns (round_number, accuracy, ...) extracted at write time
//! - Dense `fl_training_summary` table so dashboards survive retention
//! - VACUUM on a fresh connection, never inside a transaction

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::models::{coerce_f64, coerce_i64, Event};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -10240;  -- 10MB cache
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp REAL NOT NULL,
    timestamp_iso TEXT NOT NULL,
    metric_type TEXT NOT NULL,
    source_component TEXT,
    round_number INTEGER,
    accuracy REAL,
    loss REAL,
    status TEXT,
    data_json TEXT NOT NULL,
    created_at REAL DEFAULT (julianday('now'))
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp REAL NOT NULL,
    timestamp_iso TEXT NOT NULL,
    event_id TEXT,
    source_component TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event_level TEXT DEFAULT 'INFO',
    message TEXT,
    details_json TEXT,
    created_at REAL DEFAULT (julianday('now'))
);

CREATE TABLE IF NOT EXISTS fl_training_summary (
    round_number INTEGER PRIMARY KEY,
    timestamp REAL NOT NULL,
    accuracy REAL,
    loss REAL,
    training_duration REAL,
    model_size_mb REAL,
    clients_count INTEGER,
    status TEXT,
    training_complete BOOLEAN DEFAULT 0,
    updated_at REAL DEFAULT (julianday('now'))
);

CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_metrics_type_timestamp ON metrics(metric_type, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_metrics_round ON metrics(round_number) WHERE round_number IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_metrics_fl_rounds ON metrics(metric_type, round_number) WHERE metric_type LIKE 'fl_round_%';
CREATE INDEX IF NOT EXISTS idx_metrics_source_timestamp ON metrics(source_component, timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_events_component_timestamp ON events(source_component, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_events_type_timestamp ON events(event_type, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_events_level ON events(event_level);

CREATE INDEX IF NOT EXISTS idx_fl_summary_round ON fl_training_summary(round_number DESC);
CREATE INDEX IF NOT EXISTS idx_fl_summary_timestamp ON fl_training_summary(timestamp DESC);
"#;

/// A stored metric row as returned to callers.
#[derive(Debug, Clone)]
pub struct MetricRow {
    pub timestamp: String,
    pub metric_type: String,
    pub data: Value,
}

impl MetricRow {
    pub fn to_json(&self) -> Value {
        json!({
            "timestamp": self.timestamp,
            "metric_type": self.metric_type,
            "data": self.data,
        })
    }
}

/// Filters for `load_metrics` / `count_metrics`.
#[derive(Debug, Clone, Default)]
pub struct MetricQuery {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// Exact metric_type match.
    pub type_filter: Option<String>,
    /// Prefix match (metric_type LIKE '<prefix>%').
    pub type_prefix: Option<String>,
    pub source_component: Option<String>,
    pub limit: usize,
    pub offset: usize,
    pub sort_desc: bool,
}

impl MetricQuery {
    pub fn latest(type_filter: &str) -> Self {
        Self {
            type_filter: Some(type_filter.to_string()),
            limit: 1,
            sort_desc: true,
            ..Default::default()
        }
    }
}

/// Filters for `load_events` / `count_events`. Accepts both canonical and
/// legacy parameter names at the API layer; this struct is the canonical one.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub source_component: Option<String>,
    pub event_type: Option<String>,
    pub level: Option<String>,
    pub since_id: Option<i64>,
    pub limit: usize,
    pub offset: usize,
    pub sort_desc: bool,
}

pub struct MetricsStorage {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    metrics_max_age_days: i64,
    events_max_age_days: i64,
    cleanup_interval: Duration,
    last_cleanup: Mutex<Instant>,
}

impl MetricsStorage {
    pub fn new(
        output_dir: &str,
        metrics_max_age_days: i64,
        events_max_age_days: i64,
        cleanup_interval_hours: i64,
    ) -> Result<Self> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create storage dir {}", output_dir))?;
        let db_path = PathBuf::from(output_dir).join("metrics.db");

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(&db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("SQLite metrics storage initialized: {}", db_path.display());

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
            metrics_max_age_days,
            events_max_age_days,
            cleanup_interval: Duration::from_secs((cleanup_interval_hours.max(1) as u64) * 3600),
            last_cleanup: Mutex::new(Instant::now()),
        };

        // Initial retention pass; failures never block startup.
        storage.cleanup();
        Ok(storage)
    }

    /// Store one metric. Fast-path columns are extracted from the payload;
    /// write failures are logged and swallowed so collection never stops.
    pub fn store_metric(&self, metric_type: &str, data: &Value) {
        if self.should_cleanup() {
            self.cleanup();
        }
        if let Err(e) = self.store_metric_inner(metric_type, data) {
            error!("Failed to store metric '{}': {:#}", metric_type, e);
        }
    }

    fn store_metric_inner(&self, metric_type: &str, data: &Value) -> Result<()> {
        let now = Utc::now();
        let timestamp = now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6;
        let timestamp_iso = now.to_rfc3339();

        // Round number from the metric type (fl_round_<N>), else the payload.
        let mut round_number = round_from_metric_type(metric_type);
        if round_number.is_none() {
            round_number = data
                .get("round")
                .or_else(|| data.get("current_round"))
                .and_then(Value::as_i64);
        }

        let accuracy = data.get("accuracy").and_then(Value::as_f64);
        let loss = data.get("loss").and_then(Value::as_f64);
        let status = data.get("status").and_then(Value::as_str).map(str::to_string);
        let source_component = data
            .get("source_component")
            .or_else(|| data.get("source"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO metrics \
             (timestamp, timestamp_iso, metric_type, source_component, \
              round_number, accuracy, loss, status, data_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?
        .execute(params![
            timestamp,
            timestamp_iso,
            metric_type,
            source_component,
            round_number,
            accuracy,
            loss,
            status,
            serde_json::to_string(data)?,
        ])?;

        // Upsert the dense summary row for fast dashboard charts.
        if let (Some(round_number), Some(accuracy)) = (round_number, accuracy) {
            let model_size_mb = match data.get("model_size_mb") {
                Some(v) => {
                    let parsed = coerce_f64(v, f64::NAN);
                    if parsed.is_nan() {
                        warn!(
                            "Invalid model_size_mb value '{}' for round {}, using 0.0",
                            v, round_number
                        );
                        0.0
                    } else {
                        parsed
                    }
                }
                None => 0.0,
            };
            let training_duration = data
                .get("training_duration")
                .map(|v| coerce_f64(v, 0.0))
                .unwrap_or(0.0);
            let clients_count = data
                .get("clients")
                .or_else(|| data.get("connected_clients"))
                .map(|v| coerce_i64(v, 0))
                .unwrap_or(0);
            let training_complete =
                data.get("data_state").and_then(Value::as_str) == Some("training_complete");

            conn.prepare_cached(
                "INSERT OR REPLACE INTO fl_training_summary \
                 (round_number, timestamp, accuracy, loss, training_duration, \
                  model_size_mb, clients_count, status, training_complete, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, julianday('now'))",
            )?
            .execute(params![
                round_number,
                timestamp,
                accuracy,
                loss,
                training_duration,
                model_size_mb,
                clients_count,
                status,
                training_complete,
            ])?;
        }

        Ok(())
    }

    /// Store one normalized event. Failures are logged and swallowed.
    pub fn store_event(&self, event: &Event) {
        if let Err(e) = self.store_event_inner(event) {
            error!("Failed to store event '{}': {:#}", event.event_type, e);
        }
    }

    fn store_event_inner(&self, event: &Event) -> Result<()> {
        let ts = chrono::DateTime::parse_from_rfc3339(&event.timestamp)
            .map(|dt| dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1e6)
            .unwrap_or_else(|_| Utc::now().timestamp() as f64);

        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO events \
             (timestamp, timestamp_iso, event_id, source_component, \
              event_type, event_level, message, details_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?
        .execute(params![
            ts,
            event.timestamp,
            event.event_id,
            event.source_component,
            event.event_type,
            event.event_level.as_str(),
            event.message,
            serde_json::to_string(&event.details)?,
        ])?;
        Ok(())
    }

    /// Load metrics matching the query; empty on failure.
    pub fn load_metrics(&self, query: &MetricQuery) -> Vec<MetricRow> {
        match self.load_metrics_inner(query) {
            Ok(rows) => rows,
            Err(e) => {
                error!("Error loading metrics: {:#}", e);
                Vec::new()
            }
        }
    }

    fn load_metrics_inner(&self, query: &MetricQuery) -> Result<Vec<MetricRow>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ts) = query.start_time.as_deref().and_then(parse_iso_to_unix) {
            conditions.push("timestamp >= ?".into());
            args.push(Box::new(ts));
        }
        if let Some(ts) = query.end_time.as_deref().and_then(parse_iso_to_unix) {
            conditions.push("timestamp <= ?".into());
            args.push(Box::new(ts));
        }
        if let Some(t) = &query.type_filter {
            conditions.push("metric_type = ?".into());
            args.push(Box::new(t.clone()));
        }
        if let Some(prefix) = &query.type_prefix {
            conditions.push("metric_type LIKE ?".into());
            args.push(Box::new(format!("{}%", prefix.replace('%', ""))));
        }
        if let Some(sc) = &query.source_component {
            conditions.push("source_component = ?".into());
            args.push(Box::new(sc.clone()));
        }

        let where_clause = if conditions.is_empty() {
            "1=1".to_string()
        } else {
            conditions.join(" AND ")
        };
        let order = if query.sort_desc { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT timestamp_iso, metric_type, data_json FROM metrics \
             WHERE {} ORDER BY timestamp {} LIMIT ? OFFSET ?",
            where_clause, order
        );
        args.push(Box::new(query.limit.max(1) as i64));
        args.push(Box::new(query.offset as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (timestamp, metric_type, data_json) = row?;
            match serde_json::from_str(&data_json) {
                Ok(data) => out.push(MetricRow { timestamp, metric_type, data }),
                Err(_) => continue, // skip corrupted payloads
            }
        }
        Ok(out)
    }

    pub fn count_metrics(&self, type_filter: Option<&str>, source_component: Option<&str>) -> i64 {
        let result: Result<i64> = (|| {
            let mut conditions: Vec<String> = Vec::new();
            let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            if let Some(t) = type_filter {
                conditions.push("metric_type = ?".into());
                args.push(Box::new(t.to_string()));
            }
            if let Some(sc) = source_component {
                conditions.push("source_component = ?".into());
                args.push(Box::new(sc.to_string()));
            }
            let where_clause = if conditions.is_empty() {
                "1=1".to_string()
            } else {
                conditions.join(" AND ")
            };
            let conn = self.conn.lock();
            let count = conn
                .prepare_cached(&format!("SELECT COUNT(*) FROM metrics WHERE {}", where_clause))?
                .query_row(
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    |row| row.get(0),
                )?;
            Ok(count)
        })();
        result.unwrap_or_else(|e| {
            error!("Error counting metrics: {:#}", e);
            0
        })
    }

    /// Load events; each returned object carries both canonical and legacy
    /// field names (`component`, `type`, `level`) for dashboards.
    pub fn load_events(&self, query: &EventQuery) -> Vec<Value> {
        match self.load_events_inner(query) {
            Ok(events) => events,
            Err(e) => {
                error!("Error loading events: {:#}", e);
                Vec::new()
            }
        }
    }

    fn load_events_inner(&self, query: &EventQuery) -> Result<Vec<Value>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ts) = query.start_time.as_deref().and_then(parse_iso_to_unix) {
            conditions.push("timestamp >= ?".into());
            args.push(Box::new(ts));
        }
        if let Some(ts) = query.end_time.as_deref().and_then(parse_iso_to_unix) {
            conditions.push("timestamp <= ?".into());
            args.push(Box::new(ts));
        }
        if let Some(sc) = &query.source_component {
            conditions.push("source_component = ?".into());
            args.push(Box::new(sc.clone()));
        }
        if let Some(t) = &query.event_type {
            conditions.push("event_type = ?".into());
            args.push(Box::new(t.clone()));
        }
        if let Some(level) = &query.level {
            conditions.push("event_level = ?".into());
            args.push(Box::new(level.clone()));
        }
        if let Some(since_id) = query.since_id {
            conditions.push("id > ?".into());
            args.push(Box::new(since_id));
        }

        let where_clause = if conditions.is_empty() {
            "1=1".to_string()
        } else {
            conditions.join(" AND ")
        };
        let order = if query.sort_desc { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT id, timestamp_iso, event_id, source_component, event_type, \
                    event_level, message, details_json \
             FROM events WHERE {} ORDER BY timestamp {} LIMIT ? OFFSET ?",
            where_clause, order
        );
        args.push(Box::new(query.limit.max(1) as i64));
        args.push(Box::new(query.offset as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, timestamp, event_id, source_component, event_type, event_level, message, details_json) =
                row?;
            let details: Value = details_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| json!({}));
            out.push(json!({
                "id": id,
                "event_id": event_id,
                "timestamp": timestamp,
                "source_component": source_component,
                "component": source_component,
                "event_type": event_type,
                "type": event_type,
                "event_level": event_level,
                "level": event_level,
                "message": message,
                "details": details,
            }));
        }
        Ok(out)
    }

    pub fn count_events(
        &self,
        source_component: Option<&str>,
        event_type: Option<&str>,
        level: Option<&str>,
    ) -> i64 {
        let result: Result<i64> = (|| {
            let mut conditions: Vec<String> = Vec::new();
            let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            if let Some(sc) = source_component {
                conditions.push("source_component = ?".into());
                args.push(Box::new(sc.to_string()));
            }
            if let Some(t) = event_type {
                conditions.push("event_type = ?".into());
                args.push(Box::new(t.to_string()));
            }
            if let Some(l) = level {
                conditions.push("event_level = ?".into());
                args.push(Box::new(l.to_string()));
            }
            let where_clause = if conditions.is_empty() {
                "1=1".to_string()
            } else {
                conditions.join(" AND ")
            };
            let conn = self.conn.lock();
            let count = conn
                .prepare_cached(&format!("SELECT COUNT(*) FROM events WHERE {}", where_clause))?
                .query_row(
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    |row| row.get(0),
                )?;
            Ok(count)
        })();
        result.unwrap_or_else(|e| {
            error!("Error counting events: {:#}", e);
            0
        })
    }

    /// Latest `fl_server` snapshot, joined with the round summary when the
    /// snapshot's accuracy is missing or zero.
    pub fn get_latest_fl_metrics(&self) -> Option<Value> {
        let result: Result<Option<Value>> = (|| {
            let conn = self.conn.lock();
            let row = conn
                .prepare_cached(
                    "SELECT timestamp_iso, data_json, accuracy, round_number, status \
                     FROM metrics WHERE metric_type = 'fl_server' \
                     ORDER BY timestamp DESC LIMIT 1",
                )?
                .query_row([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                });
            let (timestamp, data_json, accuracy, round_number, status) = match row {
                Ok(r) => r,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            let mut data: Value = serde_json::from_str(&data_json).unwrap_or_else(|_| json!({}));

            if accuracy.unwrap_or(0.0) == 0.0 {
                let summary = conn
                    .prepare_cached(
                        "SELECT accuracy, loss FROM fl_training_summary \
                         ORDER BY round_number DESC LIMIT 1",
                    )?
                    .query_row([], |row| {
                        Ok((row.get::<_, Option<f64>>(0)?, row.get::<_, Option<f64>>(1)?))
                    });
                if let Ok((latest_accuracy, latest_loss)) = summary {
                    data["latest_accuracy"] = json!(latest_accuracy.unwrap_or(0.0));
                    data["latest_loss"] = json!(latest_loss.unwrap_or(0.0));
                }
            }

            let round = round_number
                .or_else(|| data.get("current_round").and_then(Value::as_i64))
                .unwrap_or(0);
            let accuracy = accuracy
                .filter(|a| *a != 0.0)
                .or_else(|| data.get("latest_accuracy").and_then(Value::as_f64))
                .unwrap_or(0.0);
            let status = status
                .or_else(|| data.get("status").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());

            Ok(Some(json!({
                "timestamp": timestamp,
                "data": data,
                "round": round,
                "accuracy": accuracy,
                "status": status,
            })))
        })();
        result.unwrap_or_else(|e| {
            error!("Error getting latest FL metrics: {:#}", e);
            None
        })
    }

    /// Dense per-round summary rows, ordered by round ascending.
    pub fn get_fl_summary_fast(&self, limit: usize) -> Vec<Value> {
        let result: Result<Vec<Value>> = (|| {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT round_number, timestamp, accuracy, loss, training_duration, \
                        model_size_mb, clients_count, status, training_complete \
                 FROM fl_training_summary ORDER BY round_number ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit.max(1) as i64], |row| {
                let ts: f64 = row.get(1)?;
                Ok(json!({
                    "round": row.get::<_, i64>(0)?,
                    "timestamp": chrono::DateTime::from_timestamp(ts as i64, 0)
                        .map(|dt| dt.to_rfc3339())
                        .unwrap_or_default(),
                    "accuracy": row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    "loss": row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    "training_duration": row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                    "model_size_mb": row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                    "clients_count": row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                    "status": row.get::<_, Option<String>>(7)?.unwrap_or_else(|| "unknown".into()),
                    "training_complete": row.get::<_, Option<bool>>(8)?.unwrap_or(false),
                }))
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })();
        result.unwrap_or_else(|e| {
            error!("Error loading FL summary: {:#}", e);
            Vec::new()
        })
    }

    fn should_cleanup(&self) -> bool {
        self.last_cleanup.lock().elapsed() >= self.cleanup_interval
    }

    /// Retention pass: dedup rounds, archive aged FL rounds into the summary
    /// table, delete aged rows, then VACUUM outside any transaction.
    pub fn cleanup(&self) {
        self.cleanup_duplicate_rounds();

        let metrics_cutoff =
            Utc::now().timestamp() as f64 - (self.metrics_max_age_days * 24 * 3600) as f64;
        let events_cutoff =
            Utc::now().timestamp() as f64 - (self.events_max_age_days * 24 * 3600) as f64;

        let result: Result<(usize, usize)> = (|| {
            let conn = self.conn.lock();
            // Archive aged FL rounds into the summary table before deletion.
            conn.execute(
                "INSERT OR REPLACE INTO fl_training_summary \
                 (round_number, timestamp, accuracy, loss, training_duration, \
                  model_size_mb, clients_count, status, training_complete, updated_at) \
                 SELECT \
                     round_number, \
                     timestamp, \
                     accuracy, \
                     loss, \
                     JSON_EXTRACT(data_json, '$.training_duration'), \
                     JSON_EXTRACT(data_json, '$.model_size_mb'), \
                     JSON_EXTRACT(data_json, '$.clients'), \
                     status, \
                     CASE WHEN JSON_EXTRACT(data_json, '$.data_state') = 'training_complete' THEN 1 ELSE 0 END, \
                     julianday('now') \
                 FROM metrics \
                 WHERE metric_type LIKE 'fl_round_%' \
                 AND round_number IS NOT NULL \
                 AND timestamp < ?1",
                params![metrics_cutoff],
            )?;

            let deleted_metrics =
                conn.execute("DELETE FROM metrics WHERE timestamp < ?1", params![metrics_cutoff])?;
            let deleted_events =
                conn.execute("DELETE FROM events WHERE timestamp < ?1", params![events_cutoff])?;
            Ok((deleted_metrics, deleted_events))
        })();

        match result {
            Ok((deleted_metrics, deleted_events)) => {
                // VACUUM cannot run inside a transaction; use a fresh connection.
                match Connection::open(&self.db_path).and_then(|c| c.execute("VACUUM", [])) {
                    Ok(_) => info!(
                        "Cleanup completed: {} metrics, {} events deleted. Database optimized.",
                        deleted_metrics, deleted_events
                    ),
                    Err(e) => warn!("Database VACUUM failed: {} (data cleanup successful)", e),
                }
                *self.last_cleanup.lock() = Instant::now();
            }
            Err(e) => error!("Error during cleanup: {:#}", e),
        }
    }

    /// Keep the max-id row per round in metrics and summary.
    pub fn cleanup_duplicate_rounds(&self) {
        let result: Result<()> = (|| {
            let conn = self.conn.lock();
            conn.execute(
                "DELETE FROM metrics \
                 WHERE id NOT IN ( \
                     SELECT MAX(id) FROM metrics \
                     WHERE metric_type LIKE 'fl_round_%' AND round_number IS NOT NULL \
                     GROUP BY round_number \
                 ) \
                 AND metric_type LIKE 'fl_round_%' \
                 AND round_number IS NOT NULL",
                [],
            )?;
            conn.execute(
                "DELETE FROM fl_training_summary \
                 WHERE rowid NOT IN ( \
                     SELECT MAX(rowid) FROM fl_training_summary GROUP BY round_number \
                 )",
                [],
            )?;
            Ok(())
        })();
        match result {
            Ok(()) => debug!("Cleaned up duplicate round records"),
            Err(e) => error!("Error cleaning up duplicate rounds: {:#}", e),
        }
    }

    /// Table row counts + db size, for the debug/optimize endpoint.
    pub fn stats(&self) -> Value {
        let result: Result<Value> = (|| {
            let conn = self.conn.lock();
            let mut counts = serde_json::Map::new();
            for table in ["metrics", "events", "fl_training_summary"] {
                let count: i64 = conn
                    .prepare_cached(&format!("SELECT COUNT(*) FROM {}", table))?
                    .query_row([], |row| row.get(0))?;
                counts.insert(table.to_string(), json!(count));
            }
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            let db_size_mb = (page_count * page_size) as f64 / (1024.0 * 1024.0);
            Ok(json!({
                "table_counts": Value::Object(counts),
                "database_size_mb": (db_size_mb * 100.0).round() / 100.0,
            }))
        })();
        result.unwrap_or_else(|e| {
            error!("Error collecting storage stats: {:#}", e);
            json!({"table_counts": {}, "database_size_mb": 0.0})
        })
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    /// Checkpoint the WAL and release the pooled connection's caches.
    pub fn close(&self) {
        let conn = self.conn.lock();
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            warn!("WAL checkpoint on close failed: {}", e);
        }
        info!("SQLite storage connections closed");
    }
}

fn round_from_metric_type(metric_type: &str) -> Option<i64> {
    metric_type
        .strip_prefix("fl_round_")
        .and_then(|rest| rest.split('_').next())
        .and_then(|n| n.parse().ok())
}

fn parse_iso_to_unix(raw: &str) -> Option<f64> {
    chrono::DateTime::parse_from_rfc3339(&raw.replace('Z', "+00:00"))
        .ok()
        .map(|dt| dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1e6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventLevel;
    use serde_json::json;

    fn test_storage() -> (tempfile::TempDir, MetricsStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            MetricsStorage::new(dir.path().to_str().unwrap(), 14, 7, 12).unwrap();
        (dir, storage)
    }

    #[test]
    fn metric_round_trip_preserves_payload() {
        let (_dir, storage) = test_storage();
        let data = json!({"accuracy": 0.842, "loss": 0.055, "round": 3, "nested": {"k": "v"}});
        storage.store_metric("fl_round_3", &data);

        let rows = storage.load_metrics(&MetricQuery {
            type_filter: Some("fl_round_3".into()),
            limit: 10,
            sort_desc: true,
            ..Default::default()
        });
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metric_type, "fl_round_3");
        assert_eq!(rows[0].data, data);
    }

    #[test]
    fn round_number_extracted_from_metric_type() {
        assert_eq!(round_from_metric_type("fl_round_3"), Some(3));
        assert_eq!(round_from_metric_type("fl_round_3_event"), Some(3));
        assert_eq!(round_from_metric_type("fl_server"), None);
        assert_eq!(round_from_metric_type("fl_round_x"), None);
    }

    #[test]
    fn summary_upsert_keeps_one_row_per_round() {
        let (_dir, storage) = test_storage();
        storage.store_metric("fl_round_5", &json!({"accuracy": 0.70, "loss": 0.2, "clients": 3}));
        storage.store_metric("fl_round_5", &json!({"accuracy": 0.71, "loss": 0.19, "clients": 4}));

        let summary = storage.get_fl_summary_fast(100);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0]["round"], 5);
        assert_eq!(summary[0]["accuracy"], 0.71);
        assert_eq!(summary[0]["clients_count"], 4);
    }

    #[test]
    fn model_size_strings_are_coerced() {
        let (_dir, storage) = test_storage();
        storage.store_metric(
            "fl_round_1",
            &json!({"accuracy": 0.5, "model_size_mb": "1.73", "clients": "2"}),
        );
        let summary = storage.get_fl_summary_fast(10);
        assert_eq!(summary[0]["model_size_mb"], 1.73);
        assert_eq!(summary[0]["clients_count"], 2);
    }

    #[test]
    fn events_round_trip_with_compat_fields() {
        let (_dir, storage) = test_storage();
        let event = Event::new(
            "FL_SERVER",
            "ROUND_END",
            EventLevel::Info,
            "round 3 done".into(),
            json!({"round_number": 3}),
        );
        storage.store_event(&event);

        let events = storage.load_events(&EventQuery {
            source_component: Some("FL_SERVER".into()),
            limit: 10,
            sort_desc: true,
            ..Default::default()
        });
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e["component"], e["source_component"]);
        assert_eq!(e["type"], e["event_type"]);
        assert_eq!(e["level"], e["event_level"]);
        assert_eq!(e["details"]["round_number"], 3);
    }

    #[test]
    fn event_filters_and_since_id() {
        let (_dir, storage) = test_storage();
        for (component, level) in [
            ("FL_SERVER", EventLevel::Info),
            ("POLICY_ENGINE", EventLevel::Warning),
            ("FL_SERVER", EventLevel::Error),
        ] {
            storage.store_event(&Event::new(component, "T", level, "m".into(), json!({})));
        }

        assert_eq!(storage.count_events(Some("FL_SERVER"), None, None), 2);
        assert_eq!(storage.count_events(None, None, Some("WARNING")), 1);

        let all = storage.load_events(&EventQuery { limit: 10, ..Default::default() });
        let lowest_id = all.iter().filter_map(|e| e["id"].as_i64()).min().unwrap();
        let newer = storage.load_events(&EventQuery {
            since_id: Some(lowest_id),
            limit: 10,
            ..Default::default()
        });
        assert_eq!(newer.len(), 2);
    }

    #[test]
    fn latest_fl_metrics_joins_summary_on_zero_accuracy() {
        let (_dir, storage) = test_storage();
        storage.store_metric("fl_round_2", &json!({"accuracy": 0.9, "loss": 0.1}));
        storage.store_metric("fl_server", &json!({"status": "training", "current_round": 2}));

        let latest = storage.get_latest_fl_metrics().unwrap();
        assert_eq!(latest["round"], 2);
        assert_eq!(latest["accuracy"], 0.9);
        assert_eq!(latest["data"]["latest_accuracy"], 0.9);
    }

    #[test]
    fn duplicate_round_cleanup_keeps_newest() {
        let (_dir, storage) = test_storage();
        storage.store_metric("fl_round_7", &json!({"accuracy": 0.1}));
        storage.store_metric("fl_round_7", &json!({"accuracy": 0.2}));
        storage.cleanup_duplicate_rounds();

        let rows = storage.load_metrics(&MetricQuery {
            type_prefix: Some("fl_round_".into()),
            limit: 10,
            ..Default::default()
        });
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data["accuracy"], 0.2);
    }
}
