use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use foreman_core::agent::Agent;
use foreman_core::anomaly::AnomalyDetector;
use foreman_core::bus::{AgentMessage, MessageType};
use foreman_core::config::MonitoringConfig;
use foreman_core::db::LearningDb;
use foreman_core::health::HealthScorer;
use foreman_core::types::{Alert, HealthScore, Metric, MetricType};

use crate::MONITOR_ID;

const SHUTDOWN_DEADLINE: StdDuration = StdDuration::from_secs(5);

// ── Event cache ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct TaskEvent {
    timestamp: DateTime<Utc>,
    duration: Option<f64>,
}

#[derive(Debug, Clone)]
struct PrEvent {
    timestamp: DateTime<Utc>,
    event_type: MessageType,
}

#[derive(Debug, Clone, Default)]
struct EventCache {
    task_started: Vec<TaskEvent>,
    task_completed: Vec<TaskEvent>,
    task_failed: Vec<TaskEvent>,
    pr_events: Vec<PrEvent>,
}

impl EventCache {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        self.task_started.retain(|e| e.timestamp >= cutoff);
        self.task_completed.retain(|e| e.timestamp >= cutoff);
        self.task_failed.retain(|e| e.timestamp >= cutoff);
        self.pr_events.retain(|e| e.timestamp >= cutoff);
    }

    fn counts(&self) -> BTreeMap<String, usize> {
        BTreeMap::from([
            ("task_started".to_string(), self.task_started.len()),
            ("task_completed".to_string(), self.task_completed.len()),
            ("task_failed".to_string(), self.task_failed.len()),
            ("pr_events".to_string(), self.pr_events.len()),
        ])
    }
}

// ── Dashboard result types ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricStats {
    pub current: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub trend: Trend,
    pub data_points: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub time_window_hours: i64,
    pub metrics: BTreeMap<String, MetricStats>,
    pub health_score_average: f64,
    pub active_alerts_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertsSummary {
    pub time_window_hours: i64,
    pub total: usize,
    pub active: usize,
    pub acknowledged: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_metric: BTreeMap<String, usize>,
    pub recent_alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub agent_id: String,
    pub enabled: bool,
    pub running: bool,
    pub collection_interval: u64,
    pub configured_metrics: Vec<String>,
    pub cached_events: BTreeMap<String, usize>,
    pub last_collection: Option<DateTime<Utc>>,
    pub metrics_collected: u64,
}

// ── Collector (shared with the worker task) ──────────────────────────────

struct Collector {
    cfg: MonitoringConfig,
    db: Arc<LearningDb>,
    scorer: HealthScorer,
    detector: StdMutex<AnomalyDetector>,
    cache: StdMutex<EventCache>,
    last_collection: StdMutex<Option<DateTime<Utc>>>,
    metrics_collected: AtomicU64,
}

impl Collector {
    /// One collection cycle: snapshot the cache under its lock, then compute
    /// and persist outside it.
    fn collect(&self) -> Result<()> {
        let snapshot = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            let cutoff = Utc::now() - Duration::hours(self.cfg.metrics_window_hours);
            cache.prune(cutoff);
            cache.clone()
        };

        let mut metrics = Vec::new();
        for name in &self.cfg.metrics {
            let Some(metric_type) = MetricType::parse(name) else {
                warn!(metric = %name, "unknown metric configured, skipping");
                continue;
            };
            if let Some(metric) = compute_metric(metric_type, &snapshot) {
                metrics.push(metric);
            }
        }

        for metric in &metrics {
            if let Err(e) = self.db.record_metric(metric) {
                error!(metric_id = %metric.id, "metric persistence failed: {e:#}");
            }
        }

        if !metrics.is_empty() {
            info!(count = metrics.len(), "metrics collected");

            if self.cfg.health_score.enabled {
                if let Err(e) = self.persist_health_score(&metrics) {
                    error!("health score calculation failed: {e:#}");
                }
            }
            if self.cfg.alerts.enabled {
                self.check_thresholds(&metrics);
            }
        }

        *self.last_collection.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        self.metrics_collected.fetch_add(metrics.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn persist_health_score(&self, metrics: &[Metric]) -> Result<()> {
        let values: BTreeMap<MetricType, f64> =
            metrics.iter().map(|m| (m.metric_type, m.value)).collect();
        let mut score = self.scorer.score(&values);
        score.context = json!({ "agent_id": MONITOR_ID, "metrics_count": values.len() });
        let score_id = self.db.record_health_score(&score).context("record_health_score")?;
        info!(
            score = score.score,
            status = score.status.as_str(),
            score_id,
            "health score updated"
        );
        Ok(())
    }

    fn check_thresholds(&self, metrics: &[Metric]) {
        let mut detector = self.detector.lock().unwrap_or_else(|e| e.into_inner());
        for metric in metrics {
            let Some(alert) = detector.check_metric(metric.metric_type, metric.value) else {
                continue;
            };
            match self.db.record_alert(&alert) {
                Ok(()) => info!(
                    alert_id = %alert.id,
                    metric_name = %alert.metric_name,
                    severity = alert.severity.as_str(),
                    "alert generated: {}",
                    alert.message
                ),
                Err(e) => error!(alert_id = %alert.id, "alert persistence failed: {e:#}"),
            }
        }
    }
}

fn compute_metric(metric_type: MetricType, cache: &EventCache) -> Option<Metric> {
    match metric_type {
        MetricType::TaskSuccessRate => {
            let completed = cache.task_completed.len();
            let failed = cache.task_failed.len();
            let total = completed + failed;
            if total == 0 {
                return None;
            }
            Some(Metric::new(
                metric_type,
                completed as f64 / total as f64,
                json!({ "completed": completed, "failed": failed, "total": total }),
            ))
        }
        MetricType::TaskErrorRate => {
            let completed = cache.task_completed.len();
            let failed = cache.task_failed.len();
            let total = completed + failed;
            if total == 0 {
                return None;
            }
            Some(Metric::new(
                metric_type,
                failed as f64 / total as f64,
                json!({ "completed": completed, "failed": failed, "total": total }),
            ))
        }
        MetricType::AverageExecutionTime => {
            let durations: Vec<f64> =
                cache.task_completed.iter().filter_map(|e| e.duration).collect();
            if durations.is_empty() {
                return None;
            }
            let total: f64 = durations.iter().sum();
            Some(Metric::new(
                metric_type,
                total / durations.len() as f64,
                json!({ "task_count": durations.len(), "total_duration": total }),
            ))
        }
        MetricType::PrApprovalRate => {
            let approved = cache
                .pr_events
                .iter()
                .filter(|e| e.event_type == MessageType::PrApproved)
                .count();
            let rejected = cache
                .pr_events
                .iter()
                .filter(|e| e.event_type == MessageType::PrRejected)
                .count();
            let total = approved + rejected;
            if total == 0 {
                return None;
            }
            Some(Metric::new(
                metric_type,
                approved as f64 / total as f64,
                json!({ "approved": approved, "rejected": rejected, "total": total }),
            ))
        }
        // Reserved until the QA subsystem is wired.
        MetricType::QaScoreAverage => None,
    }
}

// ── Monitor agent ────────────────────────────────────────────────────────

/// Background metric-collection daemon with health scoring, threshold
/// alerting, and read-only dashboard queries over the learning store.
pub struct Monitor {
    inner: Arc<Collector>,
    running: AtomicBool,
    shutdown: StdMutex<Option<CancellationToken>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    /// Construction validates the health-score and alert configuration;
    /// invalid weights or thresholds fail here, before any agent starts.
    pub fn new(db: Arc<LearningDb>, cfg: MonitoringConfig) -> Result<Self> {
        let scorer = HealthScorer::from_config(&cfg.health_score).context("health_score config")?;
        let detector = AnomalyDetector::from_config(&cfg.alerts).context("alerts config")?;
        Ok(Self {
            inner: Arc::new(Collector {
                cfg,
                db,
                scorer,
                detector: StdMutex::new(detector),
                cache: StdMutex::new(EventCache::default()),
                last_collection: StdMutex::new(None),
                metrics_collected: AtomicU64::new(0),
            }),
            running: AtomicBool::new(false),
            shutdown: StdMutex::new(None),
            worker: Mutex::new(None),
        })
    }

    pub fn enabled(&self) -> bool {
        self.inner.cfg.enabled
    }

    /// Run one collection cycle immediately (used by tests and the
    /// dashboard's manual refresh).
    pub fn collect_now(&self) -> Result<()> {
        self.inner.collect()
    }

    pub fn status(&self) -> MonitorStatus {
        let cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        MonitorStatus {
            agent_id: MONITOR_ID.to_string(),
            enabled: self.inner.cfg.enabled,
            running: self.running.load(Ordering::Relaxed),
            collection_interval: self.inner.cfg.collection_interval,
            configured_metrics: self.inner.cfg.metrics.clone(),
            cached_events: cache.counts(),
            last_collection: *self
                .inner
                .last_collection
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            metrics_collected: self.inner.metrics_collected.load(Ordering::Relaxed),
        }
    }

    // ── Dashboard query API (pure reads over the learning store) ─────────

    pub fn get_current_health(&self) -> Result<Option<HealthScore>> {
        Ok(self.inner.db.query_health_scores(None, 1)?.into_iter().next())
    }

    pub fn get_metrics_history(
        &self,
        metric_type: Option<MetricType>,
        hours: i64,
        limit: i64,
    ) -> Result<Vec<Metric>> {
        let start = Utc::now() - Duration::hours(hours);
        self.inner.db.query_metrics(metric_type, Some(start), None, limit)
    }

    pub fn get_health_score_history(&self, hours: i64, limit: i64) -> Result<Vec<HealthScore>> {
        let start = Utc::now() - Duration::hours(hours);
        self.inner.db.query_health_scores(Some(start), limit)
    }

    pub fn get_metrics_summary(&self, hours: i64) -> Result<MetricsSummary> {
        let start = Utc::now() - Duration::hours(hours);
        let all = self.inner.db.query_metrics(None, Some(start), None, 10_000)?;

        // Group by type, oldest first for trend computation.
        let mut by_type: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for metric in all.into_iter().rev() {
            by_type
                .entry(metric.metric_type.as_str().to_string())
                .or_default()
                .push(metric.value);
        }

        let mut metrics = BTreeMap::new();
        for (name, values) in by_type {
            let data_points = values.len();
            let current = *values.last().unwrap_or(&0.0);
            let sum: f64 = values.iter().sum();
            let average = if data_points > 0 { sum / data_points as f64 } else { 0.0 };
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            metrics.insert(
                name,
                MetricStats {
                    current,
                    average,
                    min: if min.is_finite() { min } else { 0.0 },
                    max: if max.is_finite() { max } else { 0.0 },
                    trend: compute_trend(&values),
                    data_points,
                },
            );
        }

        let scores = self.inner.db.query_health_scores(Some(start), 1_000)?;
        let health_score_average = if scores.is_empty() {
            0.0
        } else {
            scores.iter().map(|s| s.score).sum::<f64>() / scores.len() as f64
        };

        let active_alerts_count = self.get_active_alerts()?.len();

        Ok(MetricsSummary {
            time_window_hours: hours,
            metrics,
            health_score_average,
            active_alerts_count,
        })
    }

    pub fn get_alerts_summary(&self, hours: i64) -> Result<AlertsSummary> {
        let start = Utc::now() - Duration::hours(hours);
        let all = self.inner.db.query_alerts(Some(start), None, None, None, 10_000)?;

        let total = all.len();
        let acknowledged = all.iter().filter(|a| a.acknowledged).count();
        let active = total - acknowledged;

        let mut by_severity: BTreeMap<String, usize> =
            BTreeMap::from([("critical".to_string(), 0), ("warning".to_string(), 0)]);
        let mut by_metric: BTreeMap<String, usize> = BTreeMap::new();
        for alert in &all {
            *by_severity.entry(alert.severity.as_str().to_string()).or_insert(0) += 1;
            *by_metric.entry(alert.metric_name.clone()).or_insert(0) += 1;
        }

        let recent_alerts: Vec<Alert> = all.into_iter().take(5).collect();

        Ok(AlertsSummary {
            time_window_hours: hours,
            total,
            active,
            acknowledged,
            by_severity,
            by_metric,
            recent_alerts,
        })
    }

    pub fn get_active_alerts(&self) -> Result<Vec<Alert>> {
        self.inner.db.query_alerts(None, None, Some(false), None, 100)
    }

    pub fn get_alert_history(&self, hours: i64) -> Result<Vec<Alert>> {
        let start = Utc::now() - Duration::hours(hours);
        self.inner.db.query_alerts(Some(start), None, None, None, 1_000)
    }

    pub fn acknowledge_alert(&self, alert_id: &str, acknowledged_by: &str) -> Result<bool> {
        self.inner.db.acknowledge_alert(alert_id, acknowledged_by)
    }

    pub fn get_alert_counts_by_severity(&self) -> Result<BTreeMap<String, usize>> {
        let mut counts =
            BTreeMap::from([("critical".to_string(), 0), ("warning".to_string(), 0)]);
        for alert in self.get_active_alerts()? {
            *counts.entry(alert.severity.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

fn compute_trend(values: &[f64]) -> Trend {
    if values.len() < 4 {
        return Trend::Stable;
    }
    let midpoint = values.len() / 2;
    let first: f64 = values[..midpoint].iter().sum::<f64>() / midpoint as f64;
    let second: f64 =
        values[midpoint..].iter().sum::<f64>() / (values.len() - midpoint) as f64;
    // ±5 % band around the first-half mean.
    if second > first * 1.05 {
        Trend::Improving
    } else if second < first * 0.95 {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

#[async_trait]
impl Agent for Monitor {
    fn agent_id(&self) -> &str {
        MONITOR_ID
    }

    async fn handle_message(&self, message: &AgentMessage) -> Result<()> {
        if !self.inner.cfg.enabled {
            return Ok(());
        }
        let timestamp = message.timestamp;
        let mut cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        match message.message_type {
            MessageType::TaskStarted => {
                cache.task_started.push(TaskEvent { timestamp, duration: None });
            }
            MessageType::TaskCompleted => {
                cache.task_completed.push(TaskEvent {
                    timestamp,
                    duration: message.payload["duration"].as_f64(),
                });
            }
            MessageType::TaskFailed => {
                cache.task_failed.push(TaskEvent { timestamp, duration: None });
            }
            MessageType::PrCreated | MessageType::PrApproved | MessageType::PrRejected => {
                cache.pr_events.push(PrEvent { timestamp, event_type: message.message_type });
            }
            // Broadcast traffic the monitor does not chart.
            _ => {}
        }
        Ok(())
    }

    async fn on_start(&self) -> Result<()> {
        if !self.inner.cfg.enabled {
            info!("monitor started with monitoring disabled");
            return Ok(());
        }

        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let inner = Arc::clone(&self.inner);
        let interval = StdDuration::from_secs(inner.cfg.collection_interval);
        let handle = tokio::spawn(async move {
            info!(interval_s = interval.as_secs(), "collection worker started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = inner.collect() {
                            // Next cycle retries from fresh data.
                            error!("collection cycle failed: {e:#}");
                        }
                    }
                }
            }
            info!("collection worker exited");
        });

        *self.worker.lock().await = Some(handle);
        self.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Relaxed);
        if let Some(token) = self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("collection worker join error: {e}"),
                Err(_) => {
                    warn!("collection worker did not exit within 5 seconds, abandoning");
                }
            }
        }
        info!("monitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trend_requires_four_points() {
        assert_eq!(compute_trend(&[0.1, 0.9, 0.1]), Trend::Stable);
    }

    #[test]
    fn trend_improving_degrading_stable() {
        assert_eq!(compute_trend(&[0.70, 0.72, 0.85, 0.88]), Trend::Improving);
        assert_eq!(compute_trend(&[0.88, 0.85, 0.72, 0.70]), Trend::Degrading);
        assert_eq!(compute_trend(&[0.85, 0.86, 0.85, 0.86]), Trend::Stable);
    }

    #[test]
    fn success_and_error_rates_sum_to_one() {
        let mut cache = EventCache::default();
        for _ in 0..3 {
            cache.task_completed.push(TaskEvent { timestamp: Utc::now(), duration: Some(1.0) });
        }
        cache.task_failed.push(TaskEvent { timestamp: Utc::now(), duration: None });

        let success = compute_metric(MetricType::TaskSuccessRate, &cache).unwrap();
        let error = compute_metric(MetricType::TaskErrorRate, &cache).unwrap();
        assert!((success.value + error.value - 1.0).abs() < 1e-9);
        assert_eq!(success.value, 0.75);
    }

    #[test]
    fn rates_skip_when_no_tasks_observed() {
        let cache = EventCache::default();
        assert!(compute_metric(MetricType::TaskSuccessRate, &cache).is_none());
        assert!(compute_metric(MetricType::TaskErrorRate, &cache).is_none());
        assert!(compute_metric(MetricType::AverageExecutionTime, &cache).is_none());
        assert!(compute_metric(MetricType::PrApprovalRate, &cache).is_none());
    }

    #[test]
    fn qa_score_average_is_reserved() {
        let mut cache = EventCache::default();
        cache.task_completed.push(TaskEvent { timestamp: Utc::now(), duration: Some(2.0) });
        assert!(compute_metric(MetricType::QaScoreAverage, &cache).is_none());
    }

    #[test]
    fn average_execution_time_ignores_missing_durations() {
        let mut cache = EventCache::default();
        cache.task_completed.push(TaskEvent { timestamp: Utc::now(), duration: Some(2.0) });
        cache.task_completed.push(TaskEvent { timestamp: Utc::now(), duration: None });
        cache.task_completed.push(TaskEvent { timestamp: Utc::now(), duration: Some(4.0) });
        let metric = compute_metric(MetricType::AverageExecutionTime, &cache).unwrap();
        assert_eq!(metric.value, 3.0);
        assert_eq!(metric.context["task_count"], 2);
    }

    #[test]
    fn cache_prune_drops_old_events() {
        let mut cache = EventCache::default();
        let now = Utc::now();
        cache.task_completed.push(TaskEvent { timestamp: now - Duration::hours(30), duration: None });
        cache.task_completed.push(TaskEvent { timestamp: now, duration: None });
        cache.prune(now - Duration::hours(24));
        assert_eq!(cache.task_completed.len(), 1);
    }
}
