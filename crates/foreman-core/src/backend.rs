use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

/// Code-generation backend: runs one prompt and returns the produced files
/// as `{absolute path → contents}`. Failures are visible to the TechLead,
/// which converts them into `AGENT_ERROR` broadcasts.
#[async_trait]
pub trait CodegenBackend: Send + Sync {
    async fn execute(&self, prompt: &str, output_dir: &Path) -> Result<BTreeMap<String, String>>;
}
