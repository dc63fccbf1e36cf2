use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info};

use crate::backend::CodegenBackend;
use crate::gitops::GitDriver;
use crate::state::{ProjectStore, WorkLogEntry};
use crate::types::{ProjectPhase, ProjectState, TaskStatus};

/// Gear-1 execution: tasks run strictly in order with no agents, no review
/// loop, and a stop on first failure.
pub struct SequentialExecutor {
    backend: Arc<dyn CodegenBackend>,
    git: Arc<dyn GitDriver>,
    store: Arc<ProjectStore>,
}

impl SequentialExecutor {
    pub fn new(
        backend: Arc<dyn CodegenBackend>,
        git: Arc<dyn GitDriver>,
        store: Arc<ProjectStore>,
    ) -> Self {
        Self { backend, git, store }
    }

    /// Execute every task in order. The state is saved after each task; the
    /// first failure marks the project failed and stops.
    pub async fn execute_all(&self, state: &mut ProjectState) -> Result<()> {
        state.phase = ProjectPhase::Executing;
        self.store.save_project(state)?;

        for index in 0..state.tasks.len() {
            state.current_task_index = index;
            let task_id = state.tasks[index].id.clone();
            info!(task_id, "starting task");
            self.log(&state.project_id, "starting_task", &task_id);

            let result = self.execute_task(state, index).await;
            match result {
                Ok(()) => {
                    state.tasks[index].status = TaskStatus::Completed;
                    state.tasks[index].completed_at = Some(Utc::now());
                    self.store.save_project(state)?;
                    info!(task_id, "completed task");
                }
                Err(e) => {
                    state.tasks[index].status = TaskStatus::Failed;
                    state.tasks[index].error = Some(format!("{e:#}"));
                    state.phase = ProjectPhase::Failed;
                    self.store.save_project(state)?;
                    error!(task_id, "task failed: {e:#}");
                    return Err(e);
                }
            }
        }

        state.phase = ProjectPhase::Completed;
        state.completed_at = Some(Utc::now());
        self.store.save_project(state)
    }

    async fn execute_task(&self, state: &mut ProjectState, index: usize) -> Result<()> {
        let (task_id, description) = {
            let task = &mut state.tasks[index];
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            (task.id.clone(), task.description.clone())
        };

        let output_dir = self.store.artifacts_dir(&state.project_id, &task_id)?;
        let files = self
            .backend
            .execute(&description, &output_dir)
            .await
            .context("backend execution")?;
        let file_paths: Vec<String> = files.keys().cloned().collect();

        let task = &mut state.tasks[index];
        task.files_generated = file_paths.clone();

        let branch = self.git.create_branch(task).context("create branch")?;
        task.branch_name = Some(branch.clone());
        self.git.commit_changes(task, &file_paths).context("commit changes")?;
        self.git.push_branch(&branch).context("push branch")?;

        let (pr_url, pr_number) = self.git.create_pr(task).context("create PR")?;
        task.pr_url = Some(pr_url);
        task.pr_number = Some(pr_number);
        Ok(())
    }

    fn log(&self, project_id: &str, action: &str, task_id: &str) {
        let entry = WorkLogEntry::info("executor", action, json!({}), Some(task_id.to_string()));
        if let Err(e) = self.store.append_log(project_id, &entry) {
            tracing::warn!("append_log: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Task;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::Path;

    struct StubBackend {
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl CodegenBackend for StubBackend {
        async fn execute(&self, prompt: &str, output_dir: &Path) -> Result<BTreeMap<String, String>> {
            if let Some(marker) = self.fail_on {
                if prompt.contains(marker) {
                    anyhow::bail!("backend refused {marker}");
                }
            }
            let path = output_dir.join("out.py");
            std::fs::write(&path, "X = 1\n")?;
            Ok(BTreeMap::from([(path.to_string_lossy().into_owned(), "X = 1\n".to_string())]))
        }
    }

    struct StubGit;

    impl GitDriver for StubGit {
        fn create_branch(&self, task: &Task) -> Result<String> {
            Ok(format!("foreman/task-{}", task.id))
        }

        fn commit_changes(&self, _task: &Task, _file_paths: &[String]) -> Result<()> {
            Ok(())
        }

        fn push_branch(&self, _branch: &str) -> Result<()> {
            Ok(())
        }

        fn create_pr(&self, _task: &Task) -> Result<(String, i64)> {
            Ok(("https://example.test/pr/7".into(), 7))
        }
    }

    fn state_with_tasks(descriptions: &[&str]) -> ProjectState {
        let mut state = ProjectState::new("proj_seq", "demo");
        for (i, description) in descriptions.iter().enumerate() {
            state
                .tasks
                .push(Task::new(format!("task_{:03}", i + 1), *description, vec!["done".into()]));
        }
        state
    }

    #[tokio::test]
    async fn runs_all_tasks_in_order_to_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ProjectStore::new(tmp.path()).unwrap());
        let executor =
            SequentialExecutor::new(Arc::new(StubBackend { fail_on: None }), Arc::new(StubGit), store);

        let mut state = state_with_tasks(&["first", "second"]);
        executor.execute_all(&mut state).await.unwrap();

        assert_eq!(state.phase, ProjectPhase::Completed);
        assert!(state.tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert_eq!(state.tasks[1].pr_number, Some(7));
        assert_eq!(state.current_task_index, 1);
    }

    #[tokio::test]
    async fn stops_on_first_failure_and_marks_project_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ProjectStore::new(tmp.path()).unwrap());
        let executor = SequentialExecutor::new(
            Arc::new(StubBackend { fail_on: Some("second") }),
            Arc::new(StubGit),
            store,
        );

        let mut state = state_with_tasks(&["first", "second", "third"]);
        assert!(executor.execute_all(&mut state).await.is_err());

        assert_eq!(state.phase, ProjectPhase::Failed);
        assert_eq!(state.tasks[0].status, TaskStatus::Completed);
        assert_eq!(state.tasks[1].status, TaskStatus::Failed);
        assert!(state.tasks[1].error.as_deref().unwrap().contains("refused"));
        assert_eq!(state.tasks[2].status, TaskStatus::Pending);
    }
}
