use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use tracing::info;

use crate::types::Task;

/// Hosting driver for branching, commits, pushes, and PR creation.
/// Implementations must be idempotent by branch name.
pub trait GitDriver: Send + Sync {
    fn create_branch(&self, task: &Task) -> Result<String>;
    fn commit_changes(&self, task: &Task, file_paths: &[String]) -> Result<()>;
    fn push_branch(&self, branch: &str) -> Result<()>;
    /// Open (or find) the PR for the task's branch; returns (url, number).
    fn create_pr(&self, task: &Task) -> Result<(String, i64)>;
}

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Reference driver shelling out to `git` and `gh`.
pub struct ShellGit {
    pub repo_path: String,
}

impl ShellGit {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self { repo_path: repo_path.into() }
    }

    fn git(&self, args: &[&str]) -> Result<ExecResult> {
        run_in(&self.repo_path, "git", args)
    }

    fn gh(&self, args: &[&str]) -> Result<ExecResult> {
        run_in(&self.repo_path, "gh", args)
    }

    fn branch_for(task: &Task) -> String {
        format!("foreman/task-{}", task.id)
    }

    fn existing_pr(&self, branch: &str) -> Option<(String, i64)> {
        let view = self
            .gh(&["pr", "view", branch, "--json", "url,number"])
            .ok()?;
        if !view.success() {
            return None;
        }
        let parsed: serde_json::Value = serde_json::from_str(view.stdout.trim()).ok()?;
        let url = parsed.get("url")?.as_str()?.to_string();
        let number = parsed.get("number")?.as_i64()?;
        Some((url, number))
    }
}

fn run_in(dir: &str, program: &str, args: &[&str]) -> Result<ExecResult> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("failed to spawn {program} {}", args.join(" ")))?;
    Ok(ExecResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(1),
    })
}

impl GitDriver for ShellGit {
    fn create_branch(&self, task: &Task) -> Result<String> {
        let branch = Self::branch_for(task);
        // checkout -B makes re-runs land on the same branch.
        let result = self.git(&["checkout", "-B", &branch])?;
        if !result.success() {
            return Err(anyhow!("git checkout -B {branch} failed: {}", result.combined_output()));
        }
        info!(branch, task_id = %task.id, "created branch");
        Ok(branch)
    }

    fn commit_changes(&self, task: &Task, file_paths: &[String]) -> Result<()> {
        for path in file_paths {
            let add = self.git(&["add", path])?;
            if !add.success() {
                return Err(anyhow!("git add {path} failed: {}", add.combined_output()));
            }
        }

        let status = self.git(&["status", "--porcelain"])?;
        if status.stdout.trim().is_empty() {
            info!(task_id = %task.id, "nothing to commit");
            return Ok(());
        }

        let message = format!("feat({}): {}", task.id, first_line(&task.description));
        let commit = self.git(&["commit", "-m", &message])?;
        if !commit.success() {
            return Err(anyhow!("git commit failed: {}", commit.combined_output()));
        }
        Ok(())
    }

    fn push_branch(&self, branch: &str) -> Result<()> {
        let result = self.git(&["push", "-u", "origin", branch])?;
        if !result.success() {
            return Err(anyhow!("git push origin {branch} failed: {}", result.combined_output()));
        }
        Ok(())
    }

    fn create_pr(&self, task: &Task) -> Result<(String, i64)> {
        let branch = task
            .branch_name
            .clone()
            .unwrap_or_else(|| Self::branch_for(task));

        if let Some(existing) = self.existing_pr(&branch) {
            info!(branch, pr_number = existing.1, "PR already exists");
            return Ok(existing);
        }

        let title = first_line(&task.description);
        let create = self.gh(&[
            "pr",
            "create",
            "--head",
            &branch,
            "--title",
            title,
            "--body",
            "Automated implementation.",
        ])?;
        if !create.success() {
            return Err(anyhow!("gh pr create for {branch} failed: {}", create.combined_output()));
        }

        self.existing_pr(&branch)
            .ok_or_else(|| anyhow!("gh pr view for {branch} returned no PR after create"))
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text).trim()
}

/// True when `dir` is inside a git work tree.
pub fn is_git_repo(dir: &str) -> bool {
    Path::new(dir).exists()
        && run_in(dir, "git", &["rev-parse", "--is-inside-work-tree"])
            .map(|r| r.success())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_is_stable_per_task() {
        let task = Task::new("task_001", "Create a TODO CLI", vec!["works".into()]);
        assert_eq!(ShellGit::branch_for(&task), "foreman/task-task_001");
        assert_eq!(ShellGit::branch_for(&task), ShellGit::branch_for(&task));
    }

    #[test]
    fn first_line_trims_description() {
        assert_eq!(first_line("Add login\n\nWith OAuth"), "Add login");
        assert_eq!(first_line("  single  "), "single");
    }

    #[test]
    fn is_git_repo_false_outside_repo() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(&tmp.path().to_string_lossy()));
    }
}
