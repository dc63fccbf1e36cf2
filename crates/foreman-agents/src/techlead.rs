use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use foreman_core::agent::Agent;
use foreman_core::backend::CodegenBackend;
use foreman_core::bus::{AgentMessage, MessageBus, MessageType, BROADCAST};
use foreman_core::gitops::GitDriver;
use foreman_core::state::ProjectStore;
use foreman_core::types::{ProjectState, Task, TaskStatus};

use crate::{MODERATOR_ID, MONITOR_ID, TECHLEAD_ID};

struct PrInfo {
    branch_name: String,
    pr_url: String,
    pr_number: i64,
    files_changed: Vec<String>,
}

/// Executes assigned tasks and improvements: drives the codegen backend,
/// manages branches and PRs, and reports back over the bus.
pub struct TechLead {
    bus: Arc<MessageBus>,
    backend: Arc<dyn CodegenBackend>,
    git: Arc<dyn GitDriver>,
    store: Arc<ProjectStore>,
    state: Arc<Mutex<ProjectState>>,
}

impl TechLead {
    pub fn new(
        bus: Arc<MessageBus>,
        backend: Arc<dyn CodegenBackend>,
        git: Arc<dyn GitDriver>,
        store: Arc<ProjectStore>,
        state: Arc<Mutex<ProjectState>>,
    ) -> Self {
        Self { bus, backend, git, store, state }
    }

    async fn project_id(&self) -> String {
        self.state.lock().await.project_id.clone()
    }

    /// Full execution pipeline: generate code, branch, commit, push, open PR.
    async fn execute_task(&self, task: &Task, prompt: &str) -> Result<PrInfo> {
        let project_id = self.project_id().await;
        let artifacts_dir = self.store.artifacts_dir(&project_id, &task.id)?;

        info!(task_id = %task.id, "generating code");
        let files = self.backend.execute(prompt, &artifacts_dir).await?;
        let files_changed: Vec<String> = files.keys().cloned().collect();

        let branch_name = self.git.create_branch(task)?;
        let mut branched = task.clone();
        branched.branch_name = Some(branch_name.clone());

        self.git.commit_changes(&branched, &files_changed)?;
        self.git.push_branch(&branch_name)?;
        let (pr_url, pr_number) = self.git.create_pr(&branched)?;

        Ok(PrInfo { branch_name, pr_url, pr_number, files_changed })
    }

    /// Re-run the backend against feedback and update the existing branch.
    async fn incorporate_feedback(&self, task: &Task, prompt: &str) -> Result<Vec<String>> {
        let project_id = self.project_id().await;
        let artifacts_dir = self.store.artifacts_dir(&project_id, &task.id)?;

        info!(task_id = %task.id, "incorporating feedback");
        let files = self.backend.execute(prompt, &artifacts_dir).await?;
        let files_changed: Vec<String> = files.keys().cloned().collect();

        let branch_name = task
            .branch_name
            .clone()
            .with_context(|| format!("task {} has no branch to update", task.id))?;
        self.git.commit_changes(task, &files_changed)?;
        self.git.push_branch(&branch_name)?;
        Ok(files_changed)
    }

    async fn broadcast_failure(
        &self,
        error_type: &str,
        err: &anyhow::Error,
        id_field: (&str, &str),
        correlation_id: Option<String>,
    ) {
        error!("{error_type}: {err:#}");
        let mut payload = json!({
            "error_type": error_type,
            "error_message": format!("{err:#}"),
        });
        payload[id_field.0] = json!(id_field.1);
        self.bus
            .send_from(TECHLEAD_ID, MessageType::AgentError, BROADCAST, payload, correlation_id, false)
            .await;
    }

    // ── Handlers ──────────────────────────────────────────────────────────

    async fn handle_task_assigned(&self, message: &AgentMessage) -> Result<()> {
        let task_id = message.payload["task_id"]
            .as_str()
            .context("TASK_ASSIGNED payload missing task_id")?
            .to_string();

        let task = self
            .state
            .lock()
            .await
            .task(&task_id)
            .cloned()
            .with_context(|| format!("task {task_id} not found in project state"))?;

        info!(task_id, "task assignment received");
        let prompt = build_task_prompt(&task.description, &task.acceptance_criteria);

        match self.execute_task(&task, &prompt).await {
            Ok(pr) => {
                {
                    let mut state = self.state.lock().await;
                    if let Some(stored) = state.task_mut(&task_id) {
                        stored.branch_name = Some(pr.branch_name.clone());
                        stored.pr_url = Some(pr.pr_url.clone());
                        stored.pr_number = Some(pr.pr_number);
                        stored.files_generated = pr.files_changed.clone();
                    }
                }
                self.bus
                    .send_from(
                        TECHLEAD_ID,
                        MessageType::PrCreated,
                        MONITOR_ID,
                        json!({ "pr_number": pr.pr_number, "timestamp": Utc::now().to_rfc3339() }),
                        message.correlation_id.clone(),
                        false,
                    )
                    .await;
                self.bus
                    .send_from(
                        TECHLEAD_ID,
                        MessageType::PrSubmitted,
                        MODERATOR_ID,
                        json!({
                            "task_id": task_id,
                            "pr_number": pr.pr_number,
                            "pr_url": pr.pr_url,
                            "branch_name": pr.branch_name,
                            "files_changed": pr.files_changed,
                            "iteration": 1,
                        }),
                        message.correlation_id.clone(),
                        true,
                    )
                    .await;
                info!(task_id, pr_number = pr.pr_number, "PR submitted");
            }
            Err(e) => {
                self.broadcast_failure(
                    "task_execution_failed",
                    &e,
                    ("task_id", &task_id),
                    message.correlation_id.clone(),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn handle_pr_feedback(&self, message: &AgentMessage) -> Result<()> {
        let task_id = message.payload["task_id"]
            .as_str()
            .context("PR_FEEDBACK payload missing task_id")?
            .to_string();
        let pr_number = message.payload["pr_number"].as_i64().unwrap_or(0);
        let iteration = message.payload["iteration"].as_u64().unwrap_or(1) as u32;
        let feedback = message.payload["feedback"].as_array().cloned().unwrap_or_default();

        let task = self
            .state
            .lock()
            .await
            .task(&task_id)
            .cloned()
            .with_context(|| format!("task {task_id} not found in project state"))?;

        info!(task_id, iteration, feedback_count = feedback.len(), "PR feedback received");
        let prompt = build_feedback_prompt(&feedback);

        match self.incorporate_feedback(&task, &prompt).await {
            Ok(files_changed) => {
                self.bus
                    .send_from(
                        TECHLEAD_ID,
                        MessageType::PrSubmitted,
                        MODERATOR_ID,
                        json!({
                            "task_id": task_id,
                            "pr_number": pr_number,
                            "pr_url": task.pr_url,
                            "branch_name": task.branch_name,
                            "files_changed": files_changed,
                            "iteration": iteration + 1,
                        }),
                        message.correlation_id.clone(),
                        true,
                    )
                    .await;
                info!(task_id, iteration = iteration + 1, "PR updated");
            }
            Err(e) => {
                // The iteration is not advanced on collaborator failure.
                self.broadcast_failure(
                    "feedback_incorporation_failed",
                    &e,
                    ("task_id", &task_id),
                    message.correlation_id.clone(),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn handle_improvement_requested(&self, message: &AgentMessage) -> Result<()> {
        let improvement_id = message.payload["improvement_id"]
            .as_str()
            .context("IMPROVEMENT_REQUESTED payload missing improvement_id")?
            .to_string();
        let description = message.payload["description"].as_str().unwrap_or_default().to_string();
        let acceptance_criteria: Vec<String> = message.payload["acceptance_criteria"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        info!(improvement_id, "improvement request received");

        // Improvements run through the task pipeline with a synthesized task
        // carrying the improvement id.
        let mut task = Task::new(improvement_id.clone(), description.clone(), acceptance_criteria.clone());
        task.status = TaskStatus::Running;
        let prompt = build_task_prompt(&description, &acceptance_criteria);

        match self.execute_task(&task, &prompt).await {
            Ok(pr) => {
                self.bus
                    .send_from(
                        TECHLEAD_ID,
                        MessageType::ImprovementCompleted,
                        MODERATOR_ID,
                        json!({ "improvement_id": improvement_id, "pr_number": pr.pr_number }),
                        message.correlation_id.clone(),
                        false,
                    )
                    .await;
                info!(improvement_id, pr_number = pr.pr_number, "improvement completed");
            }
            Err(e) => {
                self.broadcast_failure(
                    "improvement_execution_failed",
                    &e,
                    ("improvement_id", &improvement_id),
                    message.correlation_id.clone(),
                )
                .await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for TechLead {
    fn agent_id(&self) -> &str {
        TECHLEAD_ID
    }

    async fn handle_message(&self, message: &AgentMessage) -> Result<()> {
        match message.message_type {
            MessageType::TaskAssigned => self.handle_task_assigned(message).await,
            MessageType::PrFeedback => self.handle_pr_feedback(message).await,
            MessageType::ImprovementRequested => self.handle_improvement_requested(message).await,
            MessageType::TaskCompleted => {
                info!(
                    task_id = message.payload["task_id"].as_str().unwrap_or("-"),
                    "task completion acknowledged"
                );
                Ok(())
            }
            MessageType::AgentReady | MessageType::AgentError => Ok(()),
            other => {
                warn!(message_type = ?other, "techlead received unexpected message type");
                Ok(())
            }
        }
    }
}

fn build_task_prompt(description: &str, acceptance_criteria: &[String]) -> String {
    let mut prompt = format!("{description}\n\nAcceptance Criteria:\n");
    for (i, criterion) in acceptance_criteria.iter().enumerate() {
        let _ = writeln!(prompt, "{}. {criterion}", i + 1);
    }
    prompt
}

fn build_feedback_prompt(feedback: &[serde_json::Value]) -> String {
    let mut prompt = String::from("Please address the following feedback:\n\n");
    for (i, item) in feedback.iter().enumerate() {
        let issue = item["issue"].as_str().unwrap_or("Unknown issue");
        let suggestion = item["suggestion"].as_str().unwrap_or("No suggestion");
        let _ = writeln!(prompt, "{}. {issue}", i + 1);
        let _ = writeln!(prompt, "   Suggestion: {suggestion}");
        if let Some(file) = item["file"].as_str().filter(|f| !f.is_empty()) {
            let line = item["line"].as_u64().unwrap_or(0);
            let _ = writeln!(prompt, "   File: {file}:{line}");
        }
        prompt.push('\n');
    }
    prompt
}
