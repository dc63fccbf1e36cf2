use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Task / Project ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    Initializing,
    Decomposing,
    Executing,
    Completed,
    Improvement,
    Failed,
}

/// A single unit of work, created by the decomposer and driven through the
/// PR feedback loop by the Moderator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub status: TaskStatus,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub files_generated: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>, acceptance_criteria: Vec<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            acceptance_criteria,
            status: TaskStatus::Pending,
            branch_name: None,
            pr_url: None,
            pr_number: None,
            files_generated: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Root aggregate for one orchestrated project. Mutated by the Moderator
/// only; serialized to the project store after every significant transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: String,
    pub requirements: String,
    pub phase: ProjectPhase,
    pub tasks: Vec<Task>,
    pub current_task_index: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProjectState {
    pub fn new(project_id: impl Into<String>, requirements: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            requirements: requirements.into(),
            phase: ProjectPhase::Initializing,
            tasks: Vec::new(),
            current_task_index: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn all_tasks_completed(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }

    pub fn next_pending(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.status == TaskStatus::Pending)
    }
}

// ── Improvements ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementCategory {
    Performance,
    CodeQuality,
    Testing,
    Documentation,
    Ux,
    Architecture,
}

impl ImprovementCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::CodeQuality => "code_quality",
            Self::Testing => "testing",
            Self::Documentation => "documentation",
            Self::Ux => "ux",
            Self::Architecture => "architecture",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementPriority {
    High,
    Medium,
    Low,
}

impl ImprovementPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Trivial,
    Small,
    Medium,
    Large,
}

/// A proposed change to already-produced artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Improvement {
    pub id: String,
    pub category: ImprovementCategory,
    pub priority: ImprovementPriority,
    pub target_file: String,
    pub target_line: Option<u32>,
    pub title: String,
    pub description: String,
    pub proposed_changes: String,
    pub rationale: String,
    pub impact: Impact,
    pub effort: Effort,
    pub created_at: DateTime<Utc>,
    /// Name of the analyzer that produced this improvement.
    pub analyzer_source: String,
    /// Ranking score assigned by the improvement engine.
    pub priority_score: f64,
}

impl Improvement {
    /// Factory with a generated id and timestamp; `priority_score` starts at
    /// zero and is assigned by the improvement engine.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        category: ImprovementCategory,
        priority: ImprovementPriority,
        target_file: impl Into<String>,
        target_line: Option<u32>,
        title: impl Into<String>,
        description: impl Into<String>,
        proposed_changes: impl Into<String>,
        rationale: impl Into<String>,
        impact: Impact,
        effort: Effort,
        analyzer_source: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("imp_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            category,
            priority,
            target_file: target_file.into(),
            target_line,
            title: title.into(),
            description: description.into(),
            proposed_changes: proposed_changes.into(),
            rationale: rationale.into(),
            impact,
            effort,
            created_at: Utc::now(),
            analyzer_source: analyzer_source.into(),
            priority_score: 0.0,
        }
    }
}

// ── Metrics / Health / Alerts ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    TaskSuccessRate,
    TaskErrorRate,
    AverageExecutionTime,
    PrApprovalRate,
    QaScoreAverage,
}

impl MetricType {
    pub fn all() -> &'static [MetricType] {
        &[
            Self::TaskSuccessRate,
            Self::TaskErrorRate,
            Self::AverageExecutionTime,
            Self::PrApprovalRate,
            Self::QaScoreAverage,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskSuccessRate => "task_success_rate",
            Self::TaskErrorRate => "task_error_rate",
            Self::AverageExecutionTime => "average_execution_time",
            Self::PrApprovalRate => "pr_approval_rate",
            Self::QaScoreAverage => "qa_score_average",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "task_success_rate" => Some(Self::TaskSuccessRate),
            "task_error_rate" => Some(Self::TaskErrorRate),
            "average_execution_time" => Some(Self::AverageExecutionTime),
            "pr_approval_rate" => Some(Self::PrApprovalRate),
            "qa_score_average" => Some(Self::QaScoreAverage),
            _ => None,
        }
    }
}

/// A single measurement produced by the monitor's collection cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub metric_type: MetricType,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub context: serde_json::Value,
}

impl Metric {
    pub fn new(metric_type: MetricType, value: f64, context: serde_json::Value) -> Self {
        Self {
            id: format!("metric_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            metric_type,
            value,
            timestamp: Utc::now(),
            context,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// A fired anomaly. Append-only; acknowledgment mutates the ack fields only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub alert_type: String,
    pub metric_name: String,
    pub threshold_value: f64,
    pub actual_value: f64,
    pub severity: AlertSeverity,
    pub message: String,
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "degraded" => Some(Self::Degraded),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Per-metric contribution to a health score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentScore {
    pub raw_value: f64,
    pub normalized_value: f64,
    pub weight: f64,
    pub contribution: f64,
}

/// A computed health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthScore {
    pub score: f64,
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentScore>,
    pub timestamp: DateTime<Utc>,
    pub context: serde_json::Value,
}
