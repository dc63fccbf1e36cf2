use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ProjectState;

/// Single entry in a project's append-only work log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub component: String,
    pub action: String,
    pub details: Value,
    pub task_id: Option<String>,
}

impl WorkLogEntry {
    pub fn info(component: &str, action: &str, details: Value, task_id: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: "INFO".into(),
            component: component.into(),
            action: action.into(),
            details,
            task_id,
        }
    }
}

/// Filesystem project store.
///
/// Layout: `<root>/project_<id>/{project.json, logs.jsonl,
/// artifacts/task_<id>/generated/}`. The state file is a flat JSON object
/// with tasks as an embedded array; a save→load→save round trip is
/// byte-stable.
pub struct ProjectStore {
    base_dir: PathBuf,
}

impl ProjectStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("create state dir {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    fn project_dir(&self, project_id: &str) -> PathBuf {
        self.base_dir.join(format!("project_{project_id}"))
    }

    pub fn save_project(&self, state: &ProjectState) -> Result<()> {
        let dir = self.project_dir(&state.project_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create project dir {}", dir.display()))?;
        let json = serde_json::to_string_pretty(state).context("serialize project state")?;
        let path = dir.join("project.json");
        std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn load_project(&self, project_id: &str) -> Result<Option<ProjectState>> {
        let path = self.project_dir(project_id).join("project.json");
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let state =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(state))
    }

    pub fn append_log(&self, project_id: &str, entry: &WorkLogEntry) -> Result<()> {
        use std::io::Write;
        let dir = self.project_dir(project_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create project dir {}", dir.display()))?;
        let path = dir.join("logs.jsonl");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let line = serde_json::to_string(entry).context("serialize log entry")?;
        writeln!(file, "{line}").with_context(|| format!("append to {}", path.display()))?;
        Ok(())
    }

    /// Directory where a task's generated artifacts land. Created on demand.
    pub fn artifacts_dir(&self, project_id: &str, task_id: &str) -> Result<PathBuf> {
        let dir = self
            .project_dir(project_id)
            .join("artifacts")
            .join(format!("task_{task_id}"))
            .join("generated");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create artifacts dir {}", dir.display()))?;
        Ok(dir)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Task, TaskStatus};
    use serde_json::json;

    #[test]
    fn save_load_save_is_byte_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(tmp.path()).unwrap();

        let mut state = ProjectState::new("p1", "Create a TODO CLI");
        let mut task = Task::new("task_001", "Create a TODO CLI", vec!["works".into()]);
        task.status = TaskStatus::Completed;
        task.pr_number = Some(123);
        state.tasks.push(task);

        store.save_project(&state).unwrap();
        let first = std::fs::read(tmp.path().join("project_p1/project.json")).unwrap();

        let loaded = store.load_project("p1").unwrap().unwrap();
        store.save_project(&loaded).unwrap();
        let second = std::fs::read(tmp.path().join("project_p1/project.json")).unwrap();

        assert_eq!(first, second);
        assert_eq!(loaded.tasks[0].pr_number, Some(123));
    }

    #[test]
    fn load_missing_project_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(tmp.path()).unwrap();
        assert!(store.load_project("nope").unwrap().is_none());
    }

    #[test]
    fn append_log_writes_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(tmp.path()).unwrap();
        for action in ["starting_task", "completed_task"] {
            let entry = WorkLogEntry::info("moderator", action, json!({"n": 1}), Some("task_001".into()));
            store.append_log("p1", &entry).unwrap();
        }
        let contents = std::fs::read_to_string(tmp.path().join("project_p1/logs.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: WorkLogEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.action, "starting_task");
    }

    #[test]
    fn artifacts_dir_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(tmp.path()).unwrap();
        let dir = store.artifacts_dir("p1", "task_001").unwrap();
        assert!(dir.ends_with("project_p1/artifacts/task_task_001/generated"));
        assert!(dir.is_dir());
    }
}
