use anyhow::Result;
use async_trait::async_trait;

use crate::bus::AgentMessage;

/// An addressable actor on the message bus.
///
/// `handle_message` is the only polymorphic operation; the bus catches its
/// errors, logs them, and converts them into an `AGENT_ERROR` broadcast.
/// `on_start`/`on_stop` are lifecycle hooks invoked by the orchestrator
/// around subscription; the Monitor uses them to manage its collection
/// worker.
#[async_trait]
pub trait Agent: Send + Sync {
    fn agent_id(&self) -> &str;

    async fn handle_message(&self, message: &AgentMessage) -> Result<()>;

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }
}
