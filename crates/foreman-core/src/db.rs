use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::types::{Alert, AlertSeverity, ComponentScore, HealthScore, HealthStatus, Metric, MetricType};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

/// On-disk learning store for metrics, health scores, and alerts.
///
/// Each call takes the connection lock for its duration; there are no
/// long-held transactions.
pub struct LearningDb {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn ts_str(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_metric(row: &rusqlite::Row<'_>) -> rusqlite::Result<Metric> {
    let type_str: String = row.get(1)?;
    let ts_str: String = row.get(3)?;
    let context_str: String = row.get(4)?;
    Ok(Metric {
        id: row.get(0)?,
        metric_type: MetricType::parse(&type_str).unwrap_or(MetricType::TaskSuccessRate),
        value: row.get(2)?,
        timestamp: parse_ts(&ts_str),
        context: serde_json::from_str(&context_str).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_health_score(row: &rusqlite::Row<'_>) -> rusqlite::Result<HealthScore> {
    let status_str: String = row.get(2)?;
    let components_str: String = row.get(3)?;
    let ts_str: String = row.get(4)?;
    let context_str: String = row.get(5)?;
    let components: BTreeMap<String, ComponentScore> =
        serde_json::from_str(&components_str).unwrap_or_default();
    Ok(HealthScore {
        score: row.get(1)?,
        status: HealthStatus::parse(&status_str).unwrap_or(HealthStatus::Critical),
        components,
        timestamp: parse_ts(&ts_str),
        context: serde_json::from_str(&context_str).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    let severity_str: String = row.get(5)?;
    let context_str: String = row.get(7)?;
    let ts_str: String = row.get(8)?;
    let acknowledged: i64 = row.get(9)?;
    let ack_at: Option<String> = row.get(11)?;
    Ok(Alert {
        id: row.get(0)?,
        alert_type: row.get(1)?,
        metric_name: row.get(2)?,
        threshold_value: row.get(3)?,
        actual_value: row.get(4)?,
        severity: AlertSeverity::parse(&severity_str).unwrap_or(AlertSeverity::Warning),
        message: row.get(6)?,
        context: serde_json::from_str(&context_str).unwrap_or(serde_json::Value::Null),
        timestamp: parse_ts(&ts_str),
        acknowledged: acknowledged != 0,
        acknowledged_by: row.get(10)?,
        acknowledged_at: ack_at.map(|s| parse_ts(&s)),
    })
}

const ALERT_COLUMNS: &str = "id, alert_type, metric_name, threshold_value, actual_value, \
     severity, message, context, timestamp, acknowledged, acknowledged_by, acknowledged_at";

// ── LearningDb impl ───────────────────────────────────────────────────────

impl LearningDb {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory SQLite")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Metrics ───────────────────────────────────────────────────────────

    pub fn record_metric(&self, metric: &Metric) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO metrics (id, metric_type, value, timestamp, context) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                metric.id,
                metric.metric_type.as_str(),
                metric.value,
                ts_str(metric.timestamp),
                metric.context.to_string(),
            ],
        )
        .context("record_metric")?;
        Ok(())
    }

    /// Metrics in `timestamp DESC` order, optionally filtered by type and
    /// time window.
    pub fn query_metrics(
        &self,
        metric_type: Option<MetricType>,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Metric>> {
        let mut sql = String::from(
            "SELECT id, metric_type, value, timestamp, context FROM metrics WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(mt) = metric_type {
            sql.push_str(&format!(" AND metric_type = ?{}", args.len() + 1));
            args.push(mt.as_str().to_string());
        }
        if let Some(start) = start_time {
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len() + 1));
            args.push(ts_str(start));
        }
        if let Some(end) = end_time {
            sql.push_str(&format!(" AND timestamp <= ?{}", args.len() + 1));
            args.push(ts_str(end));
        }
        sql.push_str(&format!(" ORDER BY timestamp DESC, id DESC LIMIT {limit}"));

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&sql)?;
        let metrics = stmt
            .query_map(params_from_iter(args.iter()), row_to_metric)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("query_metrics")?;
        Ok(metrics)
    }

    // ── Health scores ─────────────────────────────────────────────────────

    pub fn record_health_score(&self, score: &HealthScore) -> Result<String> {
        let id = format!("hs_{}", uuid::Uuid::new_v4().simple());
        let components =
            serde_json::to_string(&score.components).context("serialize component scores")?;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO health_scores (id, score, status, component_scores, timestamp, context) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                score.score,
                score.status.as_str(),
                components,
                ts_str(score.timestamp),
                score.context.to_string(),
            ],
        )
        .context("record_health_score")?;
        Ok(id)
    }

    /// Health scores in `timestamp DESC` order.
    pub fn query_health_scores(
        &self,
        start_time: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<HealthScore>> {
        let mut sql = String::from(
            "SELECT id, score, status, component_scores, timestamp, context FROM health_scores WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(start) = start_time {
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len() + 1));
            args.push(ts_str(start));
        }
        sql.push_str(&format!(" ORDER BY timestamp DESC, id DESC LIMIT {limit}"));

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&sql)?;
        let scores = stmt
            .query_map(params_from_iter(args.iter()), row_to_health_score)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("query_health_scores")?;
        Ok(scores)
    }

    // ── Alerts ────────────────────────────────────────────────────────────

    pub fn record_alert(&self, alert: &Alert) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO alerts (id, alert_type, metric_name, threshold_value, actual_value, \
             severity, message, context, timestamp, acknowledged, acknowledged_by, acknowledged_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                alert.id,
                alert.alert_type,
                alert.metric_name,
                alert.threshold_value,
                alert.actual_value,
                alert.severity.as_str(),
                alert.message,
                alert.context.to_string(),
                ts_str(alert.timestamp),
                alert.acknowledged as i64,
                alert.acknowledged_by,
                alert.acknowledged_at.map(ts_str),
            ],
        )
        .context("record_alert")?;
        Ok(())
    }

    /// Mark an alert acknowledged. Returns true on the first acknowledgment,
    /// false when the alert is missing or already acknowledged.
    pub fn acknowledge_alert(&self, alert_id: &str, acknowledged_by: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "UPDATE alerts SET acknowledged = 1, acknowledged_by = ?2, acknowledged_at = ?3 \
                 WHERE id = ?1 AND acknowledged = 0",
                params![alert_id, acknowledged_by, ts_str(Utc::now())],
            )
            .context("acknowledge_alert")?;
        Ok(changed > 0)
    }

    /// Alerts in `timestamp DESC` order, optionally filtered by window,
    /// acknowledgment state, and severity.
    pub fn query_alerts(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        acknowledged: Option<bool>,
        severity: Option<AlertSeverity>,
        limit: i64,
    ) -> Result<Vec<Alert>> {
        let mut sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE 1=1");
        let mut args: Vec<String> = Vec::new();
        if let Some(start) = start_time {
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len() + 1));
            args.push(ts_str(start));
        }
        if let Some(end) = end_time {
            sql.push_str(&format!(" AND timestamp <= ?{}", args.len() + 1));
            args.push(ts_str(end));
        }
        if let Some(ack) = acknowledged {
            sql.push_str(&format!(" AND acknowledged = ?{}", args.len() + 1));
            args.push(if ack { "1".into() } else { "0".into() });
        }
        if let Some(sev) = severity {
            sql.push_str(&format!(" AND severity = ?{}", args.len() + 1));
            args.push(sev.as_str().to_string());
        }
        sql.push_str(&format!(" ORDER BY timestamp DESC, id DESC LIMIT {limit}"));

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&sql)?;
        let alerts = stmt
            .query_map(params_from_iter(args.iter()), row_to_alert)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("query_alerts")?;
        Ok(alerts)
    }

    pub fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let alert = conn
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
                params![alert_id],
                row_to_alert,
            )
            .optional()
            .context("get_alert")?;
        Ok(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn db() -> LearningDb {
        let db = LearningDb::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn alert(metric: &str, at: DateTime<Utc>) -> Alert {
        Alert {
            id: format!("alert_{}", uuid::Uuid::new_v4().simple()),
            alert_type: "threshold_exceeded".into(),
            metric_name: metric.into(),
            threshold_value: 0.85,
            actual_value: 0.7,
            severity: AlertSeverity::Critical,
            message: format!("{metric} < 0.85: actual value 0.70"),
            context: json!({"consecutive_violations": 2}),
            timestamp: at,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
        }
    }

    #[test]
    fn metric_round_trip_and_ordering() {
        let db = db();
        let base = Utc::now() - Duration::minutes(10);
        for (i, value) in [0.7, 0.8, 0.9].iter().enumerate() {
            let mut m = Metric::new(MetricType::TaskSuccessRate, *value, json!({"i": i}));
            m.timestamp = base + Duration::minutes(i as i64);
            db.record_metric(&m).unwrap();
        }

        let all = db.query_metrics(Some(MetricType::TaskSuccessRate), None, None, 100).unwrap();
        assert_eq!(all.len(), 3);
        // Newest first.
        assert_eq!(all[0].value, 0.9);
        assert_eq!(all[2].value, 0.7);

        let windowed = db
            .query_metrics(None, Some(base + Duration::minutes(1)), None, 100)
            .unwrap();
        assert_eq!(windowed.len(), 2);
    }

    #[test]
    fn health_score_round_trip() {
        let db = db();
        let mut components = BTreeMap::new();
        components.insert(
            "task_success_rate".to_string(),
            ComponentScore { raw_value: 1.0, normalized_value: 1.0, weight: 1.0, contribution: 1.0 },
        );
        let score = HealthScore {
            score: 100.0,
            status: HealthStatus::Healthy,
            components,
            timestamp: Utc::now(),
            context: json!({"metrics_count": 1}),
        };
        db.record_health_score(&score).unwrap();

        let loaded = db.query_health_scores(None, 10).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, HealthStatus::Healthy);
        assert_eq!(loaded[0].components["task_success_rate"].weight, 1.0);
    }

    #[test]
    fn acknowledge_is_idempotent_with_noop_reack() {
        let db = db();
        let a = alert("task_success_rate", Utc::now());
        db.record_alert(&a).unwrap();

        assert!(db.acknowledge_alert(&a.id, "operator").unwrap());
        assert!(!db.acknowledge_alert(&a.id, "operator").unwrap());
        assert!(!db.acknowledge_alert("missing", "operator").unwrap());

        let loaded = db.get_alert(&a.id).unwrap().unwrap();
        assert!(loaded.acknowledged);
        assert_eq!(loaded.acknowledged_by.as_deref(), Some("operator"));
        assert!(loaded.acknowledged_at.is_some());
    }

    #[test]
    fn query_alerts_filters() {
        let db = db();
        let now = Utc::now();
        let a1 = alert("task_success_rate", now - Duration::hours(2));
        let mut a2 = alert("task_error_rate", now);
        a2.severity = AlertSeverity::Warning;
        db.record_alert(&a1).unwrap();
        db.record_alert(&a2).unwrap();
        db.acknowledge_alert(&a1.id, "op").unwrap();

        let active = db.query_alerts(None, None, Some(false), None, 100).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].metric_name, "task_error_rate");

        let warnings = db
            .query_alerts(None, None, None, Some(AlertSeverity::Warning), 100)
            .unwrap();
        assert_eq!(warnings.len(), 1);

        let recent = db
            .query_alerts(Some(now - Duration::hours(1)), None, None, None, 100)
            .unwrap();
        assert_eq!(recent.len(), 1);
    }
}
