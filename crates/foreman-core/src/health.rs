use std::collections::BTreeMap;

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::Value;

use crate::config::HealthScoreConfig;
use crate::types::{ComponentScore, HealthScore, HealthStatus, MetricType};

const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Combines recent metrics into a 0–100 score and a tri-valued status.
///
/// Weights must sum to 1.0 ± 0.01; thresholds must satisfy
/// 0 ≤ degraded < healthy ≤ 100. Both are validated at construction.
pub struct HealthScorer {
    weights: BTreeMap<MetricType, f64>,
    healthy_threshold: f64,
    degraded_threshold: f64,
    baseline_exec_time: f64,
    max_exec_time: f64,
}

impl HealthScorer {
    pub const DEFAULT_BASELINE_EXEC_TIME: f64 = 60.0;
    pub const DEFAULT_MAX_EXEC_TIME: f64 = 600.0;

    pub fn default_weights() -> BTreeMap<MetricType, f64> {
        BTreeMap::from([
            (MetricType::TaskSuccessRate, 0.30),
            (MetricType::TaskErrorRate, 0.25),
            (MetricType::AverageExecutionTime, 0.20),
            (MetricType::PrApprovalRate, 0.15),
            (MetricType::QaScoreAverage, 0.10),
        ])
    }

    pub fn new(
        weights: Option<BTreeMap<MetricType, f64>>,
        thresholds: Option<(f64, f64)>,
    ) -> Result<Self> {
        let weights = weights.unwrap_or_else(Self::default_weights);
        let (healthy_threshold, degraded_threshold) = thresholds.unwrap_or((80.0, 60.0));

        let weight_sum: f64 = weights.values().sum();
        if (weight_sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            bail!("health score weights must sum to 1.0 (±0.01), got {weight_sum:.4}");
        }
        if degraded_threshold >= healthy_threshold {
            bail!(
                "degraded threshold ({degraded_threshold}) must be less than healthy threshold ({healthy_threshold})"
            );
        }
        if degraded_threshold < 0.0 || healthy_threshold > 100.0 {
            bail!(
                "thresholds must be within 0–100, got degraded={degraded_threshold}, healthy={healthy_threshold}"
            );
        }

        Ok(Self {
            weights,
            healthy_threshold,
            degraded_threshold,
            baseline_exec_time: Self::DEFAULT_BASELINE_EXEC_TIME,
            max_exec_time: Self::DEFAULT_MAX_EXEC_TIME,
        })
    }

    pub fn from_config(cfg: &HealthScoreConfig) -> Result<Self> {
        let weights = match &cfg.weights {
            None => None,
            Some(raw) => {
                let mut parsed = BTreeMap::new();
                for (name, weight) in raw {
                    match MetricType::parse(name) {
                        Some(mt) => {
                            parsed.insert(mt, *weight);
                        }
                        None => bail!("unknown metric in health_score.weights: {name}"),
                    }
                }
                Some(parsed)
            }
        };
        let thresholds = cfg.thresholds.map(|t| (t.healthy, t.degraded));
        Self::new(weights, thresholds)
    }

    /// Compute a health snapshot from the supplied metric values.
    ///
    /// Weights of metrics absent from the input are redistributed
    /// proportionally among present metrics. Empty input yields
    /// `(0.0, critical)`.
    pub fn score(&self, metrics: &BTreeMap<MetricType, f64>) -> HealthScore {
        let available: BTreeMap<MetricType, f64> = self
            .weights
            .iter()
            .filter(|(mt, _)| metrics.contains_key(mt))
            .map(|(mt, w)| (*mt, *w))
            .collect();

        if available.is_empty() {
            return HealthScore {
                score: 0.0,
                status: HealthStatus::Critical,
                components: BTreeMap::new(),
                timestamp: Utc::now(),
                context: Value::Null,
            };
        }

        let total_available: f64 = available.values().sum();
        let mut components = BTreeMap::new();
        let mut weighted_sum = 0.0;

        for (mt, base_weight) in &available {
            let weight = base_weight / total_available;
            let raw_value = metrics[mt];
            let normalized_value = self.normalize(*mt, raw_value);
            let contribution = normalized_value * weight;
            weighted_sum += contribution;
            components.insert(
                mt.as_str().to_string(),
                ComponentScore { raw_value, normalized_value, weight, contribution },
            );
        }

        let score = (weighted_sum * 100.0 * 100.0).round() / 100.0;
        let score = score.clamp(0.0, 100.0);

        HealthScore {
            score,
            status: self.classify(score),
            components,
            timestamp: Utc::now(),
            context: Value::Null,
        }
    }

    pub fn classify(&self, score: f64) -> HealthStatus {
        if score >= self.healthy_threshold {
            HealthStatus::Healthy
        } else if score >= self.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }

    fn normalize(&self, metric_type: MetricType, value: f64) -> f64 {
        match metric_type {
            // Low error = high health.
            MetricType::TaskErrorRate => (1.0 - value).clamp(0.0, 1.0),
            MetricType::AverageExecutionTime => {
                if value <= self.baseline_exec_time {
                    1.0
                } else if value >= self.max_exec_time {
                    0.0
                } else {
                    let normalized = 1.0
                        - (value - self.baseline_exec_time)
                            / (self.max_exec_time - self.baseline_exec_time);
                    normalized.clamp(0.0, 1.0)
                }
            }
            // 0–100 scale.
            MetricType::QaScoreAverage => (value / 100.0).clamp(0.0, 1.0),
            MetricType::TaskSuccessRate | MetricType::PrApprovalRate => value.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> HealthScorer {
        HealthScorer::new(None, None).unwrap()
    }

    #[test]
    fn rejects_bad_weight_sum() {
        let weights = BTreeMap::from([(MetricType::TaskSuccessRate, 0.5)]);
        assert!(HealthScorer::new(Some(weights), None).is_err());
    }

    #[test]
    fn rejects_non_monotonic_thresholds() {
        assert!(HealthScorer::new(None, Some((60.0, 80.0))).is_err());
        assert!(HealthScorer::new(None, Some((120.0, 60.0))).is_err());
        assert!(HealthScorer::new(None, Some((80.0, -5.0))).is_err());
    }

    #[test]
    fn empty_input_is_critical_zero() {
        let snapshot = scorer().score(&BTreeMap::new());
        assert_eq!(snapshot.score, 0.0);
        assert_eq!(snapshot.status, HealthStatus::Critical);
        assert!(snapshot.components.is_empty());
    }

    #[test]
    fn missing_metrics_redistribute_weights() {
        // Perfect success and zero error with the remaining metrics absent
        // must still reach a full score.
        let metrics = BTreeMap::from([
            (MetricType::TaskSuccessRate, 1.0),
            (MetricType::TaskErrorRate, 0.0),
        ]);
        let snapshot = scorer().score(&metrics);
        assert_eq!(snapshot.score, 100.0);
        assert_eq!(snapshot.status, HealthStatus::Healthy);

        let weight_sum: f64 = snapshot.components.values().map(|c| c.weight).sum();
        assert!((weight_sum - 1.0).abs() <= 0.01);
        // Relative proportions preserved: 0.30 / 0.25.
        let success = &snapshot.components["task_success_rate"];
        let error = &snapshot.components["task_error_rate"];
        assert!((success.weight / error.weight - 0.30 / 0.25).abs() < 1e-9);
    }

    #[test]
    fn full_metric_set_scores_and_classifies() {
        let metrics = BTreeMap::from([
            (MetricType::TaskSuccessRate, 0.95),
            (MetricType::TaskErrorRate, 0.05),
            (MetricType::AverageExecutionTime, 120.0),
            (MetricType::PrApprovalRate, 0.90),
            (MetricType::QaScoreAverage, 85.0),
        ]);
        let snapshot = scorer().score(&metrics);
        // 0.95·.30 + 0.95·.25 + (1 − 60/540)·.20 + 0.90·.15 + 0.85·.10 ≈ 92.03
        assert!((snapshot.score - 92.03).abs() < 0.01);
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert_eq!(snapshot.components.len(), 5);
    }

    #[test]
    fn execution_time_normalization_bounds() {
        let s = scorer();
        assert_eq!(s.normalize(MetricType::AverageExecutionTime, 30.0), 1.0);
        assert_eq!(s.normalize(MetricType::AverageExecutionTime, 600.0), 0.0);
        let mid = s.normalize(MetricType::AverageExecutionTime, 330.0);
        assert!((mid - 0.5).abs() < 1e-9);
    }

    #[test]
    fn status_thresholds() {
        let s = scorer();
        assert_eq!(s.classify(80.0), HealthStatus::Healthy);
        assert_eq!(s.classify(79.99), HealthStatus::Degraded);
        assert_eq!(s.classify(60.0), HealthStatus::Degraded);
        assert_eq!(s.classify(59.99), HealthStatus::Critical);
    }

    #[test]
    fn from_config_rejects_unknown_metric() {
        let cfg = HealthScoreConfig {
            enabled: true,
            weights: Some(BTreeMap::from([("bogus_metric".to_string(), 1.0)])),
            thresholds: None,
        };
        assert!(HealthScorer::from_config(&cfg).is_err());
    }
}
