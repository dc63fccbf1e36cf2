use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use foreman_core::backend::CodegenBackend;

/// Runs a code-generation CLI as a subprocess: the prompt goes to stdin, the
/// tool works inside the task's artifacts directory, and whatever files it
/// leaves there are the result.
pub struct CliBackend {
    pub command: String,
    /// Kill the subprocess and fail after this many seconds (0 = no limit).
    pub timeout_s: u64,
}

impl CliBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into(), timeout_s: 0 }
    }

    pub fn with_timeout(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }
}

#[async_trait]
impl CodegenBackend for CliBackend {
    async fn execute(&self, prompt: &str, output_dir: &Path) -> Result<BTreeMap<String, String>> {
        info!(command = %self.command, output_dir = %output_dir.display(), "spawning codegen subprocess");

        let mut child = Command::new(&self.command)
            .arg("--print")
            .current_dir(output_dir)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn codegen backend: {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A tool that ignores stdin may close it early; that is not an
            // error.
            stdin.write_all(prompt.as_bytes()).await.ok();
        }

        let wait = child.wait_with_output();
        let output = if self.timeout_s > 0 {
            match tokio::time::timeout(std::time::Duration::from_secs(self.timeout_s), wait).await {
                Ok(result) => result.context("wait for codegen backend")?,
                Err(_) => bail!("codegen backend timed out after {}s", self.timeout_s),
            }
        } else {
            wait.await.context("wait for codegen backend")?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "codegen backend exited with {}: {}",
                output.status.code().unwrap_or(1),
                &stderr[..stderr.len().min(500)]
            );
        }

        let files = collect_files(output_dir)?;
        info!(file_count = files.len(), "codegen subprocess finished");
        Ok(files)
    }
}

/// Read every regular file under `dir` (recursively) into a path → contents
/// map. Non-UTF-8 files are skipped with a warning.
fn collect_files(dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("read_dir {}", current.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.is_file() {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => {
                        files.insert(path.to_string_lossy().into_owned(), contents);
                    }
                    Err(e) => warn!(path = %path.display(), "skipping artifact: {e}"),
                }
            }
        }
    }
    Ok(files)
}
