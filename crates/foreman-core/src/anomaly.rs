use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::config::AlertsConfig;
use crate::types::{Alert, AlertSeverity, MetricType};

/// Threshold checks with sustained-violation gating and per-metric
/// suppression windows.
///
/// Sustained-violation gating eliminates single-point transients;
/// suppression windows prevent alert storms during extended violations.
pub struct AnomalyDetector {
    thresholds_min: BTreeMap<MetricType, f64>,
    thresholds_max: BTreeMap<MetricType, f64>,
    severity_levels: BTreeMap<MetricType, AlertSeverity>,
    suppression_window: Duration,
    sustained_violations_required: u32,
    violation_counts: HashMap<MetricType, u32>,
    last_alert_times: HashMap<MetricType, DateTime<Utc>>,
}

impl AnomalyDetector {
    pub const DEFAULT_SUPPRESSION_WINDOW_MINUTES: i64 = 15;
    pub const DEFAULT_SUSTAINED_VIOLATIONS_REQUIRED: u32 = 2;

    pub fn default_thresholds_min() -> BTreeMap<MetricType, f64> {
        BTreeMap::from([
            (MetricType::TaskSuccessRate, 0.85),
            (MetricType::PrApprovalRate, 0.70),
            // QA score is on a 0–100 scale.
            (MetricType::QaScoreAverage, 70.0),
        ])
    }

    pub fn default_thresholds_max() -> BTreeMap<MetricType, f64> {
        BTreeMap::from([
            (MetricType::TaskErrorRate, 0.15),
            (MetricType::AverageExecutionTime, 300.0),
        ])
    }

    pub fn default_severity_levels() -> BTreeMap<MetricType, AlertSeverity> {
        BTreeMap::from([
            (MetricType::TaskSuccessRate, AlertSeverity::Critical),
            (MetricType::TaskErrorRate, AlertSeverity::Critical),
            (MetricType::AverageExecutionTime, AlertSeverity::Warning),
            (MetricType::PrApprovalRate, AlertSeverity::Warning),
            (MetricType::QaScoreAverage, AlertSeverity::Warning),
        ])
    }

    pub fn new(
        thresholds_min: Option<BTreeMap<MetricType, f64>>,
        thresholds_max: Option<BTreeMap<MetricType, f64>>,
        severity_levels: Option<BTreeMap<MetricType, AlertSeverity>>,
        suppression_window_minutes: Option<i64>,
        sustained_violations_required: Option<u32>,
    ) -> Result<Self> {
        let suppression_window_minutes =
            suppression_window_minutes.unwrap_or(Self::DEFAULT_SUPPRESSION_WINDOW_MINUTES);
        let sustained_violations_required =
            sustained_violations_required.unwrap_or(Self::DEFAULT_SUSTAINED_VIOLATIONS_REQUIRED);

        if suppression_window_minutes <= 0 {
            bail!("suppression_window_minutes must be > 0, got {suppression_window_minutes}");
        }
        if sustained_violations_required < 1 {
            bail!("sustained_violations_required must be >= 1, got {sustained_violations_required}");
        }

        Ok(Self {
            thresholds_min: thresholds_min.unwrap_or_else(Self::default_thresholds_min),
            thresholds_max: thresholds_max.unwrap_or_else(Self::default_thresholds_max),
            severity_levels: severity_levels.unwrap_or_else(Self::default_severity_levels),
            suppression_window: Duration::minutes(suppression_window_minutes),
            sustained_violations_required,
            violation_counts: HashMap::new(),
            last_alert_times: HashMap::new(),
        })
    }

    /// Build from the `gear3.monitoring.alerts` section. Threshold keys end
    /// in `_min` / `_max`; unknown metric names fail construction.
    pub fn from_config(cfg: &AlertsConfig) -> Result<Self> {
        let mut thresholds_min = BTreeMap::new();
        let mut thresholds_max = BTreeMap::new();
        for (key, value) in &cfg.thresholds {
            if let Some(name) = key.strip_suffix("_min") {
                match MetricType::parse(name) {
                    Some(mt) => {
                        thresholds_min.insert(mt, *value);
                    }
                    None => bail!("unknown metric in alerts.thresholds: {key}"),
                }
            } else if let Some(name) = key.strip_suffix("_max") {
                match MetricType::parse(name) {
                    Some(mt) => {
                        thresholds_max.insert(mt, *value);
                    }
                    None => bail!("unknown metric in alerts.thresholds: {key}"),
                }
            } else {
                bail!("alerts.thresholds keys must end in _min or _max: {key}");
            }
        }

        let mut severity_levels = BTreeMap::new();
        for (name, severity) in &cfg.severity_levels {
            let mt = MetricType::parse(name)
                .ok_or_else(|| anyhow::anyhow!("unknown metric in alerts.severity_levels: {name}"))?;
            let sev = AlertSeverity::parse(severity).ok_or_else(|| {
                anyhow::anyhow!("severity for {name} must be 'warning' or 'critical', got '{severity}'")
            })?;
            severity_levels.insert(mt, sev);
        }

        Self::new(
            if thresholds_min.is_empty() { None } else { Some(thresholds_min) },
            if thresholds_max.is_empty() { None } else { Some(thresholds_max) },
            if severity_levels.is_empty() { None } else { Some(severity_levels) },
            cfg.suppression_window_minutes,
            cfg.sustained_violations_required,
        )
    }

    /// Check one observation against its configured threshold.
    pub fn check_metric(&mut self, metric_type: MetricType, value: f64) -> Option<Alert> {
        self.check_metric_at(metric_type, value, Utc::now())
    }

    /// Clock-injected variant of [`check_metric`](Self::check_metric).
    pub fn check_metric_at(
        &mut self,
        metric_type: MetricType,
        value: f64,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let (threshold, comparison, violated) =
            if let Some(min) = self.thresholds_min.get(&metric_type) {
                (*min, "<", value < *min)
            } else if let Some(max) = self.thresholds_max.get(&metric_type) {
                (*max, ">", value > *max)
            } else {
                return None;
            };

        if !violated {
            self.violation_counts.insert(metric_type, 0);
            return None;
        }

        let count = self.violation_counts.entry(metric_type).or_insert(0);
        *count += 1;
        let consecutive = *count;

        if consecutive < self.sustained_violations_required {
            return None;
        }

        if let Some(last) = self.last_alert_times.get(&metric_type) {
            if now - *last < self.suppression_window {
                return None;
            }
        }

        let severity = self
            .severity_levels
            .get(&metric_type)
            .copied()
            .unwrap_or(AlertSeverity::Warning);

        let alert = Alert {
            id: format!("alert_{}", uuid::Uuid::new_v4().simple()),
            alert_type: "threshold_exceeded".into(),
            metric_name: metric_type.as_str().into(),
            threshold_value: threshold,
            actual_value: value,
            severity,
            message: format!(
                "{} {comparison} {threshold}: actual value {value:.2}",
                metric_type.as_str()
            ),
            context: json!({
                "consecutive_violations": consecutive,
                "sustained_requirement": self.sustained_violations_required,
            }),
            timestamp: now,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
        };

        self.last_alert_times.insert(metric_type, now);
        Some(alert)
    }

    /// Reset violation tracking for one metric, or all when `None`.
    pub fn reset(&mut self, metric_type: Option<MetricType>) {
        match metric_type {
            Some(mt) => {
                self.violation_counts.remove(&mt);
                self.last_alert_times.remove(&mt);
            }
            None => {
                self.violation_counts.clear();
                self.last_alert_times.clear();
            }
        }
    }

    pub fn violation_counts(&self) -> &HashMap<MetricType, u32> {
        &self.violation_counts
    }
}
