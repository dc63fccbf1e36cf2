use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::{error, info};

use foreman_core::agent::Agent;
use foreman_core::bus::{MessageBus, MessageType, BROADCAST};
use foreman_core::config::EverThinkerConfig;
use foreman_core::types::ProjectPhase;

use crate::moderator::Moderator;

/// Agent registry and lifecycle driver: subscribes registered agents to the
/// bus, announces readiness, runs the project to a terminal phase, and tears
/// everything down again.
pub struct Orchestrator {
    bus: Arc<MessageBus>,
    agents: Mutex<Vec<Arc<dyn Agent>>>,
}

impl Orchestrator {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus, agents: Mutex::new(Vec::new()) }
    }

    /// Register an agent for startup. Duplicate ids are a configuration
    /// error.
    pub fn register(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        if agents.iter().any(|a| a.agent_id() == agent.agent_id()) {
            bail!("agent '{}' is already registered", agent.agent_id());
        }
        info!(agent = agent.agent_id(), "agent registered");
        agents.push(agent);
        Ok(())
    }

    pub fn registered_ids(&self) -> Vec<String> {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|a| a.agent_id().to_string())
            .collect()
    }

    /// Subscribe and start every registered agent in registration order,
    /// broadcasting `AGENT_READY` per agent. A startup failure is broadcast
    /// as `AGENT_ERROR` and aborts the whole startup.
    pub async fn start_agents(&self) -> Result<()> {
        let agents: Vec<Arc<dyn Agent>> = self
            .agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for agent in agents {
            let id = agent.agent_id().to_string();
            self.bus
                .subscribe(Arc::clone(&agent))
                .with_context(|| format!("subscribing agent '{id}'"))?;

            if let Err(e) = agent.on_start().await {
                error!(agent = %id, "agent failed to start: {e:#}");
                self.bus
                    .send_from(
                        &id,
                        MessageType::AgentError,
                        BROADCAST,
                        json!({
                            "error_type": "startup_failure",
                            "error_message": format!("{e:#}"),
                        }),
                        None,
                        false,
                    )
                    .await;
                return Err(e).with_context(|| format!("starting agent '{id}'"));
            }

            self.bus
                .send_from(&id, MessageType::AgentReady, BROADCAST, json!({}), None, false)
                .await;
            info!(agent = %id, "agent started");
        }
        Ok(())
    }

    /// Stop and unsubscribe agents in reverse registration order.
    pub async fn stop_agents(&self) {
        let agents: Vec<Arc<dyn Agent>> = self
            .agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for agent in agents.into_iter().rev() {
            if let Err(e) = agent.on_stop().await {
                error!(agent = agent.agent_id(), "agent stop error: {e:#}");
            }
            self.bus.unsubscribe(agent.agent_id());
            info!(agent = agent.agent_id(), "agent stopped");
        }
    }

    /// Drive the project: kick off decomposition (the rest of the execution
    /// phase is event-driven and completes before the call returns), then
    /// run improvement cycles while the Ever-Thinker is enabled and the
    /// project keeps coming back completed.
    pub async fn run_project(
        &self,
        moderator: &Moderator,
        ever_thinker: &EverThinkerConfig,
    ) -> Result<ProjectPhase> {
        moderator.decompose_and_assign_tasks().await?;

        let mut phase = moderator.phase().await;
        if ever_thinker.enabled {
            let mut cycles = 0;
            while phase == ProjectPhase::Completed && cycles < ever_thinker.max_cycles {
                cycles += 1;
                info!(cycle = cycles, "running improvement cycle");
                if moderator.run_improvement_cycle().await?.is_none() {
                    break;
                }
                phase = moderator.phase().await;
            }
            phase = moderator.phase().await;
        }

        info!(phase = ?phase, "project run finished");
        Ok(phase)
    }
}
