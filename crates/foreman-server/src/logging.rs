use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

use foreman_agents::{MODERATOR_ID, MONITOR_ID, TECHLEAD_ID};

const RING_CAPACITY: usize = 500;

/// One dashboard log line. Agent log events carry structured fields
/// (task_id, pr_number, score), so those are kept instead of flattened away.
#[derive(Serialize)]
struct LogLine {
    ts: String,
    level: &'static str,
    source: &'static str,
    message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    fields: BTreeMap<&'static str, String>,
}

/// Collects an event's message plus every structured field.
#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: BTreeMap<&'static str, String>,
}

impl FieldCollector {
    fn put(&mut self, field: &tracing::field::Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.insert(field.name(), value);
        }
    }
}

impl tracing::field::Visit for FieldCollector {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.put(field, value.to_string());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.put(field, value.to_string());
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.put(field, value.to_string());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.put(field, value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        // Debug renders string-like values with surrounding quotes.
        let rendered = format!("{value:?}");
        self.put(field, rendered.trim_matches('"').to_string());
    }
}

/// Attribute an event to its agent via the module path: events logged from
/// an agent module carry that agent's bus id as their source.
fn source_of(target: &str) -> &'static str {
    let module = target.rsplit("::").next().unwrap_or(target);
    if module == MODERATOR_ID {
        MODERATOR_ID
    } else if module == TECHLEAD_ID {
        TECHLEAD_ID
    } else if module == MONITOR_ID {
        MONITOR_ID
    } else if target.starts_with("foreman_analyzers") {
        "analyzers"
    } else {
        "system"
    }
}

/// Tracing layer feeding the dashboard: every level goes to the SSE
/// broadcast channel, while the bounded ring keeps only info and above so a
/// debug-heavy run cannot evict the operationally interesting lines.
pub(crate) struct DashboardLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for DashboardLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = *event.metadata().level();
        if level == tracing::Level::TRACE {
            return;
        }

        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        let line = LogLine {
            ts: Utc::now().to_rfc3339(),
            level: match level {
                tracing::Level::ERROR => "error",
                tracing::Level::WARN => "warn",
                tracing::Level::INFO => "info",
                _ => "debug",
            },
            source: source_of(event.metadata().target()),
            message: collector.message,
            fields: collector.fields,
        };
        let Ok(json) = serde_json::to_string(&line) else {
            return;
        };

        let _ = self.tx.send(json.clone());

        // More severe levels order first in tracing's Level.
        if level <= tracing::Level::INFO {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            ring.push_back(json);
            while ring.len() > RING_CAPACITY {
                ring.pop_front();
            }
        }
    }
}
