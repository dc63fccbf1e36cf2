use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::agent::Agent;

/// Recipient id that routes a message to every subscriber except the sender.
pub const BROADCAST: &str = "*";

// ── Message model ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssigned,
    PrSubmitted,
    PrFeedback,
    TaskCompleted,
    ImprovementRequested,
    ImprovementCompleted,
    AgentError,
    AgentReady,
    TaskStarted,
    TaskFailed,
    PrCreated,
    PrApproved,
    PrRejected,
}

/// The unit of inter-agent communication. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_type: MessageType,
    pub from: String,
    pub to: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub requires_response: bool,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
}

/// Outcome of a `send`: whether any handler existed, and which handlers
/// raised.
#[derive(Debug, Default)]
pub struct SendOutcome {
    pub delivered: bool,
    pub handler_errors: Vec<String>,
}

impl SendOutcome {
    pub fn ok(&self) -> bool {
        self.delivered && self.handler_errors.is_empty()
    }
}

// ── Bus ──────────────────────────────────────────────────────────────────

/// In-process publish/subscribe router.
///
/// Dispatch is inline: `send` awaits every target handler before returning,
/// so a causality chain materializes as a single await chain and messages
/// from one sender are delivered in send order. Handler failures are caught,
/// logged, and re-broadcast as `AGENT_ERROR`; they never abort delivery to
/// the remaining broadcast subscribers.
///
/// The bus holds subscribers weakly; ownership stays with whoever registered
/// the agent (normally the orchestrator), so tearing an agent down does not
/// require the bus's cooperation.
pub struct MessageBus {
    subscribers: Mutex<HashMap<String, Weak<dyn Agent>>>,
    history: Mutex<Vec<AgentMessage>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Register one handler per agent id. Duplicate registration fails
    /// while the existing subscriber is still alive.
    pub fn subscribe(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let id = agent.agent_id().to_string();
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if subs.get(&id).and_then(Weak::upgrade).is_some() {
            bail!("agent '{id}' is already subscribed");
        }
        subs.insert(id, Arc::downgrade(&agent));
        Ok(())
    }

    /// Remove a subscription. Returns whether the agent was subscribed.
    pub fn unsubscribe(&self, agent_id: &str) -> bool {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.remove(agent_id).is_some()
    }

    pub fn is_subscribed(&self, agent_id: &str) -> bool {
        let subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.get(agent_id).and_then(Weak::upgrade).is_some()
    }

    pub fn subscriber_ids(&self) -> Vec<String> {
        let subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = subs
            .iter()
            .filter(|(_, agent)| agent.upgrade().is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Construct an immutable message with a fresh id and current timestamp.
    pub fn create_message(
        &self,
        message_type: MessageType,
        from: &str,
        to: &str,
        payload: Value,
        correlation_id: Option<String>,
        requires_response: bool,
    ) -> AgentMessage {
        AgentMessage {
            message_type,
            from: from.to_string(),
            to: to.to_string(),
            payload,
            correlation_id,
            requires_response,
            timestamp: Utc::now(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        }
    }

    /// Convenience wrapper: construct and dispatch in one call.
    pub async fn send_from(
        &self,
        from: &str,
        message_type: MessageType,
        to: &str,
        payload: Value,
        correlation_id: Option<String>,
        requires_response: bool,
    ) -> SendOutcome {
        let message = self.create_message(message_type, from, to, payload, correlation_id, requires_response);
        self.send(message).await
    }

    /// Route a message to its recipient, or to every subscriber except the
    /// sender when addressed to [`BROADCAST`]. The message is appended to
    /// history before dispatch so history order matches causal order.
    pub async fn send(&self, message: AgentMessage) -> SendOutcome {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());

        let targets = self.resolve_targets(&message);
        if targets.is_empty() {
            debug!(
                to = %message.to,
                message_type = ?message.message_type,
                "no handler subscribed for message"
            );
            return SendOutcome { delivered: false, handler_errors: Vec::new() };
        }

        let mut failed: Vec<(String, String)> = Vec::new();
        for agent in &targets {
            if let Err(e) = agent.handle_message(&message).await {
                error!(
                    agent = agent.agent_id(),
                    message_type = ?message.message_type,
                    message_id = %message.message_id,
                    "handler raised: {e:#}"
                );
                failed.push((agent.agent_id().to_string(), format!("{e:#}")));
            }
        }

        for (agent_id, err) in &failed {
            self.broadcast_handler_error(agent_id, err, &message).await;
        }

        SendOutcome {
            delivered: true,
            handler_errors: failed.into_iter().map(|(_, e)| e).collect(),
        }
    }

    /// Messages in publication order, for diagnostics and tests.
    pub fn message_history(&self) -> Vec<AgentMessage> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn resolve_targets(&self, message: &AgentMessage) -> Vec<Arc<dyn Agent>> {
        let subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if message.to == BROADCAST {
            let mut targets: Vec<(String, Arc<dyn Agent>)> = subs
                .iter()
                .filter(|(id, _)| id.as_str() != message.from)
                .filter_map(|(id, agent)| agent.upgrade().map(|a| (id.clone(), a)))
                .collect();
            // Deterministic broadcast order.
            targets.sort_by(|(a, _), (b, _)| a.cmp(b));
            targets.into_iter().map(|(_, a)| a).collect()
        } else {
            subs.get(&message.to).and_then(Weak::upgrade).into_iter().collect()
        }
    }

    /// Convert a handler failure into an `AGENT_ERROR` broadcast from the
    /// failing agent. Errors raised while delivering the error itself are
    /// only logged.
    async fn broadcast_handler_error(&self, failed_agent: &str, err: &str, origin: &AgentMessage) {
        let error_message = self.create_message(
            MessageType::AgentError,
            failed_agent,
            BROADCAST,
            json!({
                "error_type": "handler_error",
                "error_message": err,
                "originating_id": origin.message_id,
            }),
            origin.correlation_id.clone(),
            false,
        );

        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(error_message.clone());

        for agent in self.resolve_targets(&error_message) {
            if let Err(e) = agent.handle_message(&error_message).await {
                warn!(agent = agent.agent_id(), "AGENT_ERROR handler raised: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        id: String,
        seen: Mutex<Vec<MessageType>>,
        fail_on: Option<MessageType>,
        handled: AtomicUsize,
    }

    impl Recorder {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                seen: Mutex::new(Vec::new()),
                fail_on: None,
                handled: AtomicUsize::new(0),
            })
        }

        fn failing(id: &str, on: MessageType) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                seen: Mutex::new(Vec::new()),
                fail_on: Some(on),
                handled: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Agent for Recorder {
        fn agent_id(&self) -> &str {
            &self.id
        }

        async fn handle_message(&self, message: &AgentMessage) -> Result<()> {
            self.seen.lock().unwrap().push(message.message_type);
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(message.message_type) {
                bail!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_subscription_fails() {
        let bus = MessageBus::new();
        let first = Recorder::new("a");
        let second = Recorder::new("a");
        bus.subscribe(first.clone()).unwrap();
        assert!(bus.subscribe(second.clone()).is_err());
    }

    #[tokio::test]
    async fn unsubscribe_restores_pre_registration_state() {
        let bus = MessageBus::new();
        assert!(!bus.is_subscribed("a"));
        let a = Recorder::new("a");
        bus.subscribe(a.clone()).unwrap();
        assert!(bus.is_subscribed("a"));
        assert!(bus.unsubscribe("a"));
        assert!(!bus.is_subscribed("a"));
        // Re-registration works after unsubscribe.
        bus.subscribe(a.clone()).unwrap();
        assert!(bus.is_subscribed("a"));
    }

    #[tokio::test]
    async fn dropped_agent_frees_its_subscription() {
        let bus = MessageBus::new();
        let a = Recorder::new("a");
        bus.subscribe(a.clone()).unwrap();
        // The bus holds the agent weakly; ownership stays with the caller.
        drop(a);
        assert!(!bus.is_subscribed("a"));
        let replacement = Recorder::new("a");
        bus.subscribe(replacement.clone()).unwrap();
        assert!(bus.is_subscribed("a"));
    }

    #[tokio::test]
    async fn point_to_point_delivery() {
        let bus = MessageBus::new();
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        bus.subscribe(a.clone()).unwrap();
        bus.subscribe(b.clone()).unwrap();

        let outcome = bus
            .send_from("a", MessageType::AgentReady, "b", json!({}), None, false)
            .await;
        assert!(outcome.ok());
        assert_eq!(b.handled.load(Ordering::SeqCst), 1);
        assert_eq!(a.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let bus = MessageBus::new();
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        let c = Recorder::new("c");
        for agent in [a.clone(), b.clone(), c.clone()] {
            bus.subscribe(agent).unwrap();
        }

        bus.send_from("a", MessageType::AgentReady, BROADCAST, json!({}), None, false)
            .await;

        assert_eq!(a.handled.load(Ordering::SeqCst), 0);
        assert_eq!(b.handled.load(Ordering::SeqCst), 1);
        assert_eq!(c.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_handler_reports_undelivered() {
        let bus = MessageBus::new();
        let outcome = bus
            .send_from("a", MessageType::AgentReady, "ghost", json!({}), None, false)
            .await;
        assert!(!outcome.delivered);
        // The message still lands in history.
        assert_eq!(bus.message_history().len(), 1);
    }

    #[tokio::test]
    async fn handler_failure_becomes_agent_error_broadcast() {
        let bus = MessageBus::new();
        let failing = Recorder::failing("b", MessageType::TaskAssigned);
        let observer = Recorder::new("c");
        bus.subscribe(failing.clone()).unwrap();
        bus.subscribe(observer.clone()).unwrap();

        let outcome = bus
            .send_from("a", MessageType::TaskAssigned, "b", json!({"task_id": "t"}), None, false)
            .await;

        assert!(outcome.delivered);
        assert_eq!(outcome.handler_errors.len(), 1);
        // Observer saw the converted AGENT_ERROR.
        assert_eq!(observer.seen.lock().unwrap().as_slice(), &[MessageType::AgentError]);

        let history = bus.message_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].message_type, MessageType::AgentError);
        assert_eq!(history[1].from, "b");
        assert_eq!(
            history[1].payload["originating_id"].as_str(),
            Some(history[0].message_id.as_str())
        );
    }

    #[tokio::test]
    async fn history_preserves_send_order() {
        let bus = MessageBus::new();
        let b = Recorder::new("b");
        bus.subscribe(b.clone()).unwrap();
        for mt in [MessageType::TaskStarted, MessageType::TaskCompleted, MessageType::PrCreated] {
            bus.send_from("a", mt, "b", json!({}), None, false).await;
        }
        let types: Vec<MessageType> = bus.message_history().iter().map(|m| m.message_type).collect();
        assert_eq!(
            types,
            vec![MessageType::TaskStarted, MessageType::TaskCompleted, MessageType::PrCreated]
        );
    }
}
