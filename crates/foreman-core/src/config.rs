use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Full application configuration: flat runtime knobs from environment /
/// .env, plus the nested `gear3` section from an optional JSON config file.
/// Absent fields mean "use default", never "explicitly zero".
#[derive(Debug, Clone)]
pub struct Config {
    /// 1 | 2 | 3: selects which agents the orchestrator registers.
    pub gear: u8,
    pub project_id: String,
    pub requirements: String,
    pub state_dir: String,
    pub data_dir: String,
    pub repo_path: String,

    // Codegen backend
    pub backend_cmd: String,
    pub backend_timeout_s: u64,

    // Review loop
    pub max_pr_iterations: u32,

    // Web dashboard
    pub web_bind: String,
    pub web_port: u16,

    pub gear3: Gear3Config,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Gear3Config {
    pub ever_thinker: EverThinkerConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EverThinkerConfig {
    pub enabled: bool,
    pub max_cycles: u32,
}

impl Default for EverThinkerConfig {
    fn default() -> Self {
        Self { enabled: false, max_cycles: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    /// Seconds between metric collections.
    pub collection_interval: u64,
    pub metrics_window_hours: i64,
    /// Metric names to collect.
    pub metrics: Vec<String>,
    pub health_score: HealthScoreConfig,
    pub alerts: AlertsConfig,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            collection_interval: 300,
            metrics_window_hours: 24,
            metrics: vec![
                "task_success_rate".into(),
                "task_error_rate".into(),
                "average_execution_time".into(),
                "pr_approval_rate".into(),
                "qa_score_average".into(),
            ],
            health_score: HealthScoreConfig::default(),
            alerts: AlertsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HealthScoreConfig {
    pub enabled: bool,
    /// Metric-name → weight overrides. `None` means the default weight map.
    pub weights: Option<BTreeMap<String, f64>>,
    pub thresholds: Option<HealthThresholds>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HealthThresholds {
    pub healthy: f64,
    pub degraded: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    /// Keys like `task_success_rate_min` / `task_error_rate_max`.
    pub thresholds: BTreeMap<String, f64>,
    /// Metric-name → "warning" | "critical".
    pub severity_levels: BTreeMap<String, String>,
    pub suppression_window_minutes: Option<i64>,
    pub sustained_violations_required: Option<u32>,
}

// ── Environment helpers ──────────────────────────────────────────────────

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u8(key: &str, dotenv: &HashMap<String, String>, default: u8) -> u8 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ── Loading ──────────────────────────────────────────────────────────────

impl Config {
    /// Load configuration from environment / .env, merging the nested
    /// `gear3` section from the JSON file named by `FOREMAN_CONFIG` (default
    /// `foreman.json`) when that file exists. Unknown JSON keys are ignored.
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let config_path = get_str("FOREMAN_CONFIG", &dotenv, "foreman.json");
        let gear3 = Self::load_gear3(&config_path)?;

        Ok(Config {
            gear: get_u8("FOREMAN_GEAR", &dotenv, 2),
            project_id: get_str("FOREMAN_PROJECT_ID", &dotenv, ""),
            requirements: get_str("FOREMAN_REQUIREMENTS", &dotenv, ""),
            state_dir: get_str("FOREMAN_STATE_DIR", &dotenv, "state"),
            data_dir: get_str("FOREMAN_DATA_DIR", &dotenv, "store"),
            repo_path: get_str("FOREMAN_REPO", &dotenv, "."),
            backend_cmd: get_str("FOREMAN_BACKEND_CMD", &dotenv, "claude"),
            backend_timeout_s: get_u64("FOREMAN_BACKEND_TIMEOUT_S", &dotenv, 600),
            max_pr_iterations: get_u32("FOREMAN_MAX_PR_ITERATIONS", &dotenv, 3),
            web_bind: get_str("FOREMAN_WEB_BIND", &dotenv, "127.0.0.1"),
            web_port: get_u16("FOREMAN_WEB_PORT", &dotenv, 3141),
            gear3,
        })
    }

    fn load_gear3(path: &str) -> Result<Gear3Config> {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct FileConfig {
            gear3: Gear3Config,
        }

        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Gear3Config::default()),
            Err(e) => return Err(e).with_context(|| format!("read config file {path}")),
        };
        let parsed: FileConfig =
            serde_json::from_str(&contents).with_context(|| format!("invalid JSON in {path}"))?;
        Ok(parsed.gear3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitoring_defaults() {
        let cfg = MonitoringConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.collection_interval, 300);
        assert_eq!(cfg.metrics_window_hours, 24);
        assert_eq!(cfg.metrics.len(), 5);
        assert!(cfg.alerts.suppression_window_minutes.is_none());
    }

    #[test]
    fn gear3_section_parses_with_unknown_keys_ignored() {
        let raw = r#"{
            "gear": 3,
            "some_future_section": {"x": 1},
            "gear3": {
                "ever_thinker": {"enabled": true, "max_cycles": 2},
                "monitoring": {
                    "enabled": true,
                    "collection_interval": 60,
                    "metrics": ["task_success_rate"],
                    "health_score": {"enabled": true, "weights": {"task_success_rate": 1.0}},
                    "alerts": {
                        "enabled": true,
                        "thresholds": {"task_success_rate_min": 0.9},
                        "severity_levels": {"task_success_rate": "critical"},
                        "suppression_window_minutes": 5,
                        "sustained_violations_required": 1,
                        "unknown_knob": true
                    }
                }
            }
        }"#;
        #[derive(Deserialize)]
        struct Wrapper {
            gear3: Gear3Config,
        }
        let parsed: Wrapper = serde_json::from_str(raw).unwrap();
        let g3 = parsed.gear3;
        assert!(g3.ever_thinker.enabled);
        assert_eq!(g3.ever_thinker.max_cycles, 2);
        assert!(g3.monitoring.enabled);
        assert_eq!(g3.monitoring.collection_interval, 60);
        assert_eq!(g3.monitoring.metrics, vec!["task_success_rate"]);
        assert_eq!(g3.monitoring.alerts.suppression_window_minutes, Some(5));
        assert_eq!(
            g3.monitoring.alerts.thresholds.get("task_success_rate_min"),
            Some(&0.9)
        );
    }

    #[test]
    fn absent_fields_fall_back_to_defaults_not_zero() {
        let g3: Gear3Config = serde_json::from_str("{}").unwrap();
        assert_eq!(g3.monitoring.collection_interval, 300);
        assert_eq!(g3.ever_thinker.max_cycles, 3);
        assert!(g3.monitoring.health_score.weights.is_none());
    }
}
