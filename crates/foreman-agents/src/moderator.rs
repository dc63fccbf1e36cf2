use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use foreman_analyzers::ImprovementEngine;
use foreman_core::agent::Agent;
use foreman_core::bus::{AgentMessage, MessageBus, MessageType};
use foreman_core::decompose::Decomposer;
use foreman_core::review::{ReviewPr, ReviewResult, APPROVAL_THRESHOLD};
use foreman_core::state::{ProjectStore, WorkLogEntry};
use foreman_core::types::{
    Improvement, ImprovementCategory, ProjectPhase, ProjectState, TaskStatus,
};

use crate::{MODERATOR_ID, MONITOR_ID, TECHLEAD_ID};

/// Owns the ProjectState and drives the project through its phases:
/// decomposition, task assignment, the PR feedback loop, and improvement
/// cycles.
pub struct Moderator {
    bus: Arc<MessageBus>,
    decomposer: Arc<dyn Decomposer>,
    reviewer: Arc<dyn ReviewPr>,
    engine: Arc<ImprovementEngine>,
    store: Arc<ProjectStore>,
    state: Arc<Mutex<ProjectState>>,
    /// Highest PR iteration seen per task; lower arrivals are late
    /// duplicates.
    pr_iterations: Mutex<HashMap<String, u32>>,
    /// Improvements currently offered to the TechLead, by id.
    improvements: Mutex<HashMap<String, Improvement>>,
    max_pr_iterations: u32,
}

impl Moderator {
    pub fn new(
        bus: Arc<MessageBus>,
        decomposer: Arc<dyn Decomposer>,
        reviewer: Arc<dyn ReviewPr>,
        engine: Arc<ImprovementEngine>,
        store: Arc<ProjectStore>,
        state: Arc<Mutex<ProjectState>>,
        max_pr_iterations: u32,
    ) -> Self {
        Self {
            bus,
            decomposer,
            reviewer,
            engine,
            store,
            state,
            pr_iterations: Mutex::new(HashMap::new()),
            improvements: Mutex::new(HashMap::new()),
            max_pr_iterations,
        }
    }

    pub fn state(&self) -> Arc<Mutex<ProjectState>> {
        Arc::clone(&self.state)
    }

    pub async fn phase(&self) -> ProjectPhase {
        self.state.lock().await.phase
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = self.state.lock().await.clone();
        self.store.save_project(&snapshot)
    }

    async fn log(&self, action: &str, details: serde_json::Value, task_id: Option<String>) {
        let project_id = self.state.lock().await.project_id.clone();
        let entry = WorkLogEntry::info(MODERATOR_ID, action, details, task_id);
        if let Err(e) = self.store.append_log(&project_id, &entry) {
            warn!("append_log: {e:#}");
        }
    }

    // ── Decomposition & assignment ────────────────────────────────────────

    /// Decompose the project requirements into tasks and assign the first
    /// one. Returns the number of tasks created.
    pub async fn decompose_and_assign_tasks(&self) -> Result<usize> {
        let requirements = {
            let mut state = self.state.lock().await;
            state.phase = ProjectPhase::Decomposing;
            state.requirements.clone()
        };
        self.persist().await?;
        info!("decomposing requirements");

        let tasks = self.decomposer.decompose(&requirements)?;
        let count = tasks.len();
        {
            let mut state = self.state.lock().await;
            state.tasks = tasks;
            state.phase = ProjectPhase::Executing;
        }
        self.persist().await?;
        self.log("tasks_created", json!({ "task_count": count }), None).await;

        self.assign_next_task().await?;
        Ok(count)
    }

    /// Assign the next pending task to the TechLead, or close out the
    /// executing phase when none remain.
    pub async fn assign_next_task(&self) -> Result<Option<String>> {
        let assignment = {
            let mut state = self.state.lock().await;
            let next = state.tasks.iter().position(|t| t.status == TaskStatus::Pending);
            match next {
                None => {
                    if state.all_tasks_completed() && state.phase == ProjectPhase::Executing {
                        state.phase = ProjectPhase::Completed;
                        state.completed_at = Some(Utc::now());
                    }
                    None
                }
                Some(index) => {
                    state.current_task_index = index;
                    let task = &mut state.tasks[index];
                    task.status = TaskStatus::Running;
                    task.started_at = Some(Utc::now());
                    Some((task.id.clone(), task.description.clone(), task.acceptance_criteria.clone()))
                }
            }
        };
        self.persist().await?;

        let Some((task_id, description, acceptance_criteria)) = assignment else {
            info!("no pending tasks");
            return Ok(None);
        };

        let correlation_id = format!("corr_{task_id}");
        self.bus
            .send_from(
                MODERATOR_ID,
                MessageType::TaskStarted,
                MONITOR_ID,
                json!({ "task_id": task_id, "timestamp": Utc::now().to_rfc3339() }),
                Some(correlation_id.clone()),
                false,
            )
            .await;
        self.bus
            .send_from(
                MODERATOR_ID,
                MessageType::TaskAssigned,
                TECHLEAD_ID,
                json!({
                    "task_id": task_id,
                    "description": description,
                    "acceptance_criteria": acceptance_criteria,
                }),
                Some(correlation_id),
                true,
            )
            .await;

        info!(task_id, "task assigned");
        self.log("task_assigned", json!({}), Some(task_id.clone())).await;
        Ok(Some(task_id))
    }

    // ── PR review loop ────────────────────────────────────────────────────

    async fn handle_pr_submitted(&self, message: &AgentMessage) -> Result<()> {
        let task_id = message.payload["task_id"]
            .as_str()
            .context("PR_SUBMITTED payload missing task_id")?
            .to_string();
        let pr_number = message.payload["pr_number"].as_i64().unwrap_or(0);
        let iteration = message.payload["iteration"].as_u64().unwrap_or(1) as u32;

        {
            let mut iterations = self.pr_iterations.lock().await;
            let highest = iterations.get(&task_id).copied().unwrap_or(0);
            if iteration < highest {
                info!(task_id, iteration, highest, "ignoring late duplicate PR submission");
                return Ok(());
            }
            iterations.insert(task_id.clone(), iteration);
        }

        let task = self
            .state
            .lock()
            .await
            .task(&task_id)
            .cloned()
            .with_context(|| format!("PR_SUBMITTED for unknown task {task_id}"))?;

        info!(task_id, pr_number, iteration, "PR submitted");
        let review = self.reviewer.review_pr(pr_number, &task)?;
        info!(task_id, score = review.score, approved = review.approved, "PR reviewed");

        if review.approved && review.score >= APPROVAL_THRESHOLD {
            self.approve_pr(message, &task_id, pr_number, &review).await
        } else if iteration < self.max_pr_iterations {
            self.send_pr_feedback(message, &task_id, pr_number, iteration, &review).await
        } else {
            self.reject_pr(message, &task_id, pr_number, iteration, &review).await
        }
    }

    async fn approve_pr(
        &self,
        original: &AgentMessage,
        task_id: &str,
        pr_number: i64,
        review: &ReviewResult,
    ) -> Result<()> {
        let duration_s = {
            let mut state = self.state.lock().await;
            let task = state
                .task_mut(task_id)
                .with_context(|| format!("approved task {task_id} vanished from state"))?;
            task.status = TaskStatus::Completed;
            let completed = Utc::now();
            task.completed_at = Some(completed);
            task.started_at
                .map(|started| (completed - started).num_milliseconds() as f64 / 1000.0)
        };
        self.persist().await?;

        let total_iterations = self
            .pr_iterations
            .lock()
            .await
            .get(task_id)
            .copied()
            .unwrap_or(1);

        self.bus
            .send_from(
                MODERATOR_ID,
                MessageType::TaskCompleted,
                TECHLEAD_ID,
                json!({
                    "task_id": task_id,
                    "pr_number": pr_number,
                    "final_score": review.score,
                    "total_iterations": total_iterations,
                    "approved": true,
                }),
                original.correlation_id.clone(),
                false,
            )
            .await;
        self.bus
            .send_from(
                MODERATOR_ID,
                MessageType::PrApproved,
                MONITOR_ID,
                json!({ "pr_number": pr_number, "timestamp": Utc::now().to_rfc3339() }),
                original.correlation_id.clone(),
                false,
            )
            .await;
        self.bus
            .send_from(
                MODERATOR_ID,
                MessageType::TaskCompleted,
                MONITOR_ID,
                json!({
                    "task_id": task_id,
                    "timestamp": Utc::now().to_rfc3339(),
                    "duration": duration_s,
                }),
                original.correlation_id.clone(),
                false,
            )
            .await;

        info!(task_id, final_score = review.score, "PR approved");
        self.log("pr_approved", json!({ "final_score": review.score }), Some(task_id.into())).await;

        self.assign_next_task().await?;
        Ok(())
    }

    async fn send_pr_feedback(
        &self,
        original: &AgentMessage,
        task_id: &str,
        pr_number: i64,
        iteration: u32,
        review: &ReviewResult,
    ) -> Result<()> {
        self.bus
            .send_from(
                MODERATOR_ID,
                MessageType::PrFeedback,
                TECHLEAD_ID,
                json!({
                    "task_id": task_id,
                    "pr_number": pr_number,
                    "iteration": iteration,
                    "score": review.score,
                    "approved": false,
                    "blocking_issues": review.blocking_issues,
                    "suggestions": review.suggestions,
                    "feedback": review.feedback,
                    "criteria_scores": review.criteria_scores,
                }),
                original.correlation_id.clone(),
                true,
            )
            .await;

        info!(task_id, iteration, score = review.score, "PR feedback sent");
        self.log(
            "pr_feedback_sent",
            json!({ "iteration": iteration, "score": review.score }),
            Some(task_id.into()),
        )
        .await;
        Ok(())
    }

    async fn reject_pr(
        &self,
        original: &AgentMessage,
        task_id: &str,
        pr_number: i64,
        iteration: u32,
        review: &ReviewResult,
    ) -> Result<()> {
        let error = format!(
            "PR rejected after {iteration} iterations (final score {})",
            review.score
        );
        {
            let mut state = self.state.lock().await;
            if let Some(task) = state.task_mut(task_id) {
                task.status = TaskStatus::Failed;
                task.error = Some(error.clone());
            }
            state.phase = ProjectPhase::Failed;
        }
        self.persist().await?;

        self.bus
            .send_from(
                MODERATOR_ID,
                MessageType::PrRejected,
                MONITOR_ID,
                json!({ "pr_number": pr_number, "timestamp": Utc::now().to_rfc3339() }),
                original.correlation_id.clone(),
                false,
            )
            .await;
        self.bus
            .send_from(
                MODERATOR_ID,
                MessageType::TaskFailed,
                MONITOR_ID,
                json!({
                    "task_id": task_id,
                    "timestamp": Utc::now().to_rfc3339(),
                    "error": error,
                }),
                original.correlation_id.clone(),
                false,
            )
            .await;

        error!(task_id, final_score = review.score, "PR rejected after max iterations");
        self.log("pr_rejected", json!({ "final_score": review.score }), Some(task_id.into())).await;
        Ok(())
    }

    // ── Improvement cycle ─────────────────────────────────────────────────

    /// Run one improvement cycle: pick the top-ranked improvement and hand
    /// it to the TechLead. Returns its id, or `None` when the engine is out
    /// of candidates (which completes the project).
    pub async fn run_improvement_cycle(&self) -> Result<Option<String>> {
        info!("improvement cycle started");
        let snapshot = self.state.lock().await.clone();
        let candidates = self.engine.identify_improvements(&snapshot);

        let Some(top) = candidates.into_iter().next() else {
            info!("no improvements found");
            let mut state = self.state.lock().await;
            state.phase = ProjectPhase::Completed;
            drop(state);
            self.persist().await?;
            return Ok(None);
        };

        {
            let mut state = self.state.lock().await;
            state.phase = ProjectPhase::Improvement;
        }
        self.persist().await?;

        info!(
            improvement_id = %top.id,
            priority_score = top.priority_score,
            "improvement selected"
        );

        let acceptance_criteria = improvement_acceptance_criteria(top.category);
        let correlation_id = format!("corr_{}", top.id);
        let payload = json!({
            "improvement_id": top.id,
            "description": top.description,
            "category": top.category,
            "priority": top.priority,
            "acceptance_criteria": acceptance_criteria,
        });
        let id = top.id.clone();
        self.improvements.lock().await.insert(id.clone(), top);

        self.bus
            .send_from(
                MODERATOR_ID,
                MessageType::ImprovementRequested,
                TECHLEAD_ID,
                payload,
                Some(correlation_id),
                true,
            )
            .await;
        Ok(Some(id))
    }

    async fn handle_improvement_completed(&self, message: &AgentMessage) -> Result<()> {
        let improvement_id = message.payload["improvement_id"]
            .as_str()
            .context("IMPROVEMENT_COMPLETED payload missing improvement_id")?;

        if self.improvements.lock().await.remove(improvement_id).is_none() {
            bail!("IMPROVEMENT_COMPLETED for unknown improvement {improvement_id}");
        }

        info!(improvement_id, "improvement completed");
        {
            let mut state = self.state.lock().await;
            state.phase = ProjectPhase::Completed;
            if state.completed_at.is_none() {
                state.completed_at = Some(Utc::now());
            }
        }
        self.persist().await?;
        Ok(())
    }

    // ── Crash handling ────────────────────────────────────────────────────

    async fn handle_agent_error(&self, message: &AgentMessage) -> Result<()> {
        let error_message = message.payload["error_message"].as_str().unwrap_or("unknown error");
        let task_id = message.payload["task_id"].as_str().map(str::to_string);
        error!(
            from = %message.from,
            task_id = task_id.as_deref().unwrap_or("-"),
            "agent error: {error_message}"
        );

        let Some(task_id) = task_id else {
            return Ok(());
        };

        let failed = {
            let mut state = self.state.lock().await;
            match state.task_mut(&task_id) {
                Some(task) if task.status == TaskStatus::Running => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error_message.to_string());
                    state.phase = ProjectPhase::Failed;
                    true
                }
                _ => false,
            }
        };
        if failed {
            self.persist().await?;
            self.log("task_failed", json!({ "error": error_message }), Some(task_id)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for Moderator {
    fn agent_id(&self) -> &str {
        MODERATOR_ID
    }

    async fn handle_message(&self, message: &AgentMessage) -> Result<()> {
        match message.message_type {
            MessageType::PrSubmitted => self.handle_pr_submitted(message).await,
            MessageType::ImprovementCompleted => self.handle_improvement_completed(message).await,
            MessageType::AgentError => self.handle_agent_error(message).await,
            MessageType::AgentReady => Ok(()),
            other => {
                warn!(message_type = ?other, "moderator received unexpected message type");
                Ok(())
            }
        }
    }
}

/// Category-specific acceptance criteria attached to improvement requests.
fn improvement_acceptance_criteria(category: ImprovementCategory) -> Vec<String> {
    let specific = match category {
        ImprovementCategory::Performance => "The flagged hot path no longer does redundant work",
        ImprovementCategory::CodeQuality => "Cyclomatic complexity is at or below 10 after the change",
        ImprovementCategory::Testing => "The flagged coverage gap has tests exercising it",
        ImprovementCategory::Documentation => "The flagged surface is documented where it is defined",
        ImprovementCategory::Ux => "The flagged interaction reports actionable information to the user",
        ImprovementCategory::Architecture => "The flagged structure is split along its responsibilities",
    };
    vec![specific.to_string(), "Existing tests still pass".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_criteria_cover_every_category() {
        for category in [
            ImprovementCategory::Performance,
            ImprovementCategory::CodeQuality,
            ImprovementCategory::Testing,
            ImprovementCategory::Documentation,
            ImprovementCategory::Ux,
            ImprovementCategory::Architecture,
        ] {
            let criteria = improvement_acceptance_criteria(category);
            assert!(criteria.len() >= 2);
            assert!(criteria.iter().all(|c| !c.is_empty()));
        }
    }
}
