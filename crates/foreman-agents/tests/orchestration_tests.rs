//! End-to-end orchestration scenarios: Moderator + TechLead over the bus
//! with scripted collaborators.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use foreman_agents::moderator::Moderator;
use foreman_agents::orchestrator::Orchestrator;
use foreman_agents::techlead::TechLead;
use foreman_agents::{MODERATOR_ID, TECHLEAD_ID};
use foreman_analyzers::{AnalyzerPipeline, ImprovementEngine};
use foreman_core::backend::CodegenBackend;
use foreman_core::bus::{MessageBus, MessageType};
use foreman_core::decompose::Decomposer;
use foreman_core::gitops::GitDriver;
use foreman_core::review::{ReviewPr, ReviewResult};
use foreman_core::state::ProjectStore;
use foreman_core::types::{ProjectPhase, ProjectState, Task, TaskStatus};

// ── Scripted collaborators ───────────────────────────────────────────────

struct OneTaskDecomposer;

impl Decomposer for OneTaskDecomposer {
    fn decompose(&self, requirements: &str) -> Result<Vec<Task>> {
        Ok(vec![Task::new("task_001", requirements, vec!["It works".to_string()])])
    }
}

/// Writes a fixed set of files into the output directory.
struct FileWritingBackend {
    files: Vec<(&'static str, &'static str)>,
    fail: bool,
}

#[async_trait]
impl CodegenBackend for FileWritingBackend {
    async fn execute(&self, _prompt: &str, output_dir: &Path) -> Result<BTreeMap<String, String>> {
        if self.fail {
            bail!("backend exploded");
        }
        let mut out = BTreeMap::new();
        for (name, contents) in &self.files {
            let path = output_dir.join(name);
            std::fs::write(&path, contents)?;
            out.insert(path.to_string_lossy().into_owned(), (*contents).to_string());
        }
        Ok(out)
    }
}

#[derive(Default)]
struct RecordingGit {
    pr_counter: AtomicI64,
    pushes: AtomicI64,
}

impl GitDriver for RecordingGit {
    fn create_branch(&self, task: &Task) -> Result<String> {
        Ok(format!("foreman/task-{}", task.id))
    }

    fn commit_changes(&self, _task: &Task, _file_paths: &[String]) -> Result<()> {
        Ok(())
    }

    fn push_branch(&self, _branch: &str) -> Result<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_pr(&self, _task: &Task) -> Result<(String, i64)> {
        // Idempotent by branch: the same PR number on every call.
        let _ = self.pr_counter.compare_exchange(0, 123, Ordering::SeqCst, Ordering::SeqCst);
        let number = self.pr_counter.load(Ordering::SeqCst);
        Ok((format!("https://example.test/pr/{number}"), number))
    }
}

struct ScriptedReviewer {
    script: StdMutex<VecDeque<ReviewResult>>,
}

impl ScriptedReviewer {
    fn new(results: Vec<ReviewResult>) -> Self {
        Self { script: StdMutex::new(results.into()) }
    }
}

impl ReviewPr for ScriptedReviewer {
    fn review_pr(&self, _pr_number: i64, _task: &Task) -> Result<ReviewResult> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("reviewer script exhausted"))
    }
}

/// Build a review whose criteria scores sum to `score` (greedy against the
/// per-criterion maxima).
fn review(score: u32, blocking: Vec<&str>) -> ReviewResult {
    let mut remaining = score;
    let mut criteria_scores = BTreeMap::new();
    for (name, max) in [
        ("code_quality", 30),
        ("test_coverage", 25),
        ("security", 20),
        ("documentation", 15),
        ("acceptance_criteria", 10),
    ] {
        let part = remaining.min(max);
        criteria_scores.insert(name.to_string(), part);
        remaining -= part;
    }
    assert_eq!(remaining, 0, "score must be expressible by the criteria maxima");

    let blocking_issues: Vec<String> = blocking.into_iter().map(str::to_string).collect();
    ReviewResult {
        score,
        approved: score >= 80 && blocking_issues.is_empty(),
        blocking_issues,
        suggestions: vec![],
        feedback: vec![],
        criteria_scores,
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    bus: Arc<MessageBus>,
    orchestrator: Orchestrator,
    moderator: Arc<Moderator>,
    _tmp: tempfile::TempDir,
}

async fn harness(reviews: Vec<ReviewResult>, backend_fails: bool) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let bus = Arc::new(MessageBus::new());
    let store = Arc::new(ProjectStore::new(tmp.path()).unwrap());
    let state = Arc::new(Mutex::new(ProjectState::new("proj_test", "Create a TODO CLI")));

    let moderator = Arc::new(Moderator::new(
        Arc::clone(&bus),
        Arc::new(OneTaskDecomposer),
        Arc::new(ScriptedReviewer::new(reviews)),
        Arc::new(ImprovementEngine::new(AnalyzerPipeline::with_default_analyzers(), 1)),
        Arc::clone(&store),
        Arc::clone(&state),
        3,
    ));
    let techlead = Arc::new(TechLead::new(
        Arc::clone(&bus),
        Arc::new(FileWritingBackend {
            files: vec![("app.py", "def run():\n    return 0\n"), ("test_app.py", "def test_run():\n    assert run() == 0\n")],
            fail: backend_fails,
        }),
        Arc::new(RecordingGit::default()),
        Arc::clone(&store),
        Arc::clone(&state),
    ));

    let orchestrator = Orchestrator::new(Arc::clone(&bus));
    orchestrator.register(Arc::clone(&moderator) as _).unwrap();
    orchestrator.register(techlead as _).unwrap();
    orchestrator.start_agents().await.unwrap();

    Harness { bus, orchestrator, moderator, _tmp: tmp }
}

fn types_between(bus: &MessageBus, from: &str, to: &str) -> Vec<MessageType> {
    bus.message_history()
        .into_iter()
        .filter(|m| m.from == from && m.to == to)
        .map(|m| m.message_type)
        .collect()
}

/// Messages with the same correlation id must form a contiguous block with
/// no interleaving foreign correlation id.
fn assert_correlation_contiguity(bus: &MessageBus) {
    let mut closed: HashSet<String> = HashSet::new();
    let mut current: Option<String> = None;
    for message in bus.message_history() {
        let Some(corr) = message.correlation_id else {
            continue;
        };
        match &current {
            Some(active) if *active == corr => {}
            _ => {
                assert!(
                    !closed.contains(&corr),
                    "correlation id {corr} reappeared after interleaving traffic"
                );
                if let Some(active) = current.take() {
                    closed.insert(active);
                }
                current = Some(corr);
            }
        }
    }
}

// ── Scenario 1: approve on first try ─────────────────────────────────────

#[tokio::test]
async fn approve_on_first_try() {
    let h = harness(vec![review(85, vec![])], false).await;
    let phase = h
        .orchestrator
        .run_project(&h.moderator, &Default::default())
        .await
        .unwrap();

    assert_eq!(phase, ProjectPhase::Completed);

    // Moderator → TechLead and back, in causal order.
    assert_eq!(
        types_between(&h.bus, MODERATOR_ID, TECHLEAD_ID),
        vec![MessageType::TaskAssigned, MessageType::TaskCompleted]
    );
    assert_eq!(
        types_between(&h.bus, TECHLEAD_ID, MODERATOR_ID),
        vec![MessageType::PrSubmitted]
    );

    let history = h.bus.message_history();
    let submitted = history
        .iter()
        .find(|m| m.message_type == MessageType::PrSubmitted)
        .unwrap();
    assert_eq!(submitted.payload["pr_number"], 123);
    assert_eq!(submitted.payload["iteration"], 1);

    let completed = history
        .iter()
        .find(|m| m.message_type == MessageType::TaskCompleted && m.to == TECHLEAD_ID)
        .unwrap();
    assert_eq!(completed.payload["task_id"], "task_001");
    assert_eq!(completed.payload["final_score"], 85);
    assert_eq!(completed.payload["total_iterations"], 1);
    assert_eq!(completed.payload["approved"], true);

    let state = h.moderator.state();
    let state = state.lock().await;
    assert_eq!(state.tasks[0].status, TaskStatus::Completed);
    assert_eq!(state.tasks[0].pr_number, Some(123));
    assert_eq!(state.phase, ProjectPhase::Completed);
    drop(state);

    assert_correlation_contiguity(&h.bus);
}

#[tokio::test]
async fn score_of_exactly_80_approves() {
    let h = harness(vec![review(80, vec![])], false).await;
    let phase = h
        .orchestrator
        .run_project(&h.moderator, &Default::default())
        .await
        .unwrap();

    assert_eq!(phase, ProjectPhase::Completed);
    let state = h.moderator.state();
    assert_eq!(state.lock().await.tasks[0].status, TaskStatus::Completed);
}

#[tokio::test]
async fn pr_for_unknown_task_is_a_fatal_handler_error() {
    let h = harness(vec![review(85, vec![])], false).await;

    let outcome = h
        .bus
        .send_from(
            TECHLEAD_ID,
            MessageType::PrSubmitted,
            MODERATOR_ID,
            json!({ "task_id": "task_999", "pr_number": 9, "pr_url": "u", "iteration": 1 }),
            Some("corr_task_999".to_string()),
            true,
        )
        .await;

    assert!(!outcome.handler_errors.is_empty());
    let history = h.bus.message_history();
    let converted = history.last().unwrap();
    assert_eq!(converted.message_type, MessageType::AgentError);
    assert_eq!(converted.from, MODERATOR_ID);
    assert!(converted.payload["error_message"]
        .as_str()
        .unwrap()
        .contains("task_999"));
}

// ── Scenario 2: feedback then approve ────────────────────────────────────

#[tokio::test]
async fn feedback_then_approve() {
    let h = harness(vec![review(65, vec!["Missing tests"]), review(85, vec![])], false).await;
    let phase = h
        .orchestrator
        .run_project(&h.moderator, &Default::default())
        .await
        .unwrap();

    assert_eq!(phase, ProjectPhase::Completed);
    assert_eq!(
        types_between(&h.bus, MODERATOR_ID, TECHLEAD_ID),
        vec![MessageType::TaskAssigned, MessageType::PrFeedback, MessageType::TaskCompleted]
    );
    assert_eq!(
        types_between(&h.bus, TECHLEAD_ID, MODERATOR_ID),
        vec![MessageType::PrSubmitted, MessageType::PrSubmitted]
    );

    let history = h.bus.message_history();
    let feedback = history
        .iter()
        .find(|m| m.message_type == MessageType::PrFeedback)
        .unwrap();
    assert_eq!(feedback.payload["iteration"], 1);
    assert_eq!(feedback.payload["score"], 65);
    assert_eq!(feedback.payload["blocking_issues"][0], "Missing tests");

    let submissions: Vec<u64> = history
        .iter()
        .filter(|m| m.message_type == MessageType::PrSubmitted)
        .map(|m| m.payload["iteration"].as_u64().unwrap())
        .collect();
    assert_eq!(submissions, vec![1, 2]);

    let completed = history
        .iter()
        .find(|m| m.message_type == MessageType::TaskCompleted && m.to == TECHLEAD_ID)
        .unwrap();
    assert_eq!(completed.payload["final_score"], 85);
    assert_eq!(completed.payload["total_iterations"], 2);

    assert_correlation_contiguity(&h.bus);
}

// ── Scenario 3: max-iteration reject ─────────────────────────────────────

#[tokio::test]
async fn max_iteration_reject() {
    let reviews = vec![
        review(60, vec!["Still broken"]),
        review(60, vec!["Still broken"]),
        review(60, vec!["Still broken"]),
    ];
    let h = harness(reviews, false).await;
    let phase = h
        .orchestrator
        .run_project(&h.moderator, &Default::default())
        .await
        .unwrap();

    assert_eq!(phase, ProjectPhase::Failed);

    let history = h.bus.message_history();
    let count = |t: MessageType| history.iter().filter(|m| m.message_type == t).count();
    assert_eq!(count(MessageType::TaskAssigned), 1);
    assert_eq!(count(MessageType::PrSubmitted), 3);
    assert_eq!(count(MessageType::PrFeedback), 2);
    assert_eq!(
        history
            .iter()
            .filter(|m| m.message_type == MessageType::TaskCompleted && m.to == TECHLEAD_ID)
            .count(),
        0
    );

    // Every PR_FEEDBACK went out below the iteration cap.
    for message in history.iter().filter(|m| m.message_type == MessageType::PrFeedback) {
        assert!(message.payload["iteration"].as_u64().unwrap() < 3);
    }

    let state = h.moderator.state();
    let state = state.lock().await;
    assert_eq!(state.tasks[0].status, TaskStatus::Failed);
    assert!(state.tasks[0].error.as_deref().unwrap().contains("rejected"));
    assert_eq!(state.phase, ProjectPhase::Failed);
}

// ── Collaborator failure ─────────────────────────────────────────────────

#[tokio::test]
async fn backend_failure_fails_the_task() {
    let h = harness(vec![], true).await;
    let phase = h
        .orchestrator
        .run_project(&h.moderator, &Default::default())
        .await
        .unwrap();

    assert_eq!(phase, ProjectPhase::Failed);

    let history = h.bus.message_history();
    let agent_error = history
        .iter()
        .find(|m| m.message_type == MessageType::AgentError)
        .unwrap();
    assert_eq!(agent_error.from, TECHLEAD_ID);
    assert_eq!(agent_error.payload["error_type"], "task_execution_failed");
    assert_eq!(agent_error.payload["task_id"], "task_001");

    let state = h.moderator.state();
    let state = state.lock().await;
    assert_eq!(state.tasks[0].status, TaskStatus::Failed);
    assert!(state.tasks[0].error.as_deref().unwrap().contains("backend exploded"));
}

// ── Improvement cycle ────────────────────────────────────────────────────

#[tokio::test]
async fn improvement_cycle_requests_and_completes() {
    // The generated app.py has no docstrings, so the documentation analyzer
    // has something to propose after the task completes.
    let h = harness(vec![review(85, vec![])], false).await;
    h.orchestrator
        .run_project(&h.moderator, &Default::default())
        .await
        .unwrap();
    assert_eq!(h.moderator.phase().await, ProjectPhase::Completed);

    let requested = h.moderator.run_improvement_cycle().await.unwrap();
    let improvement_id = requested.expect("analyzers should surface an improvement");

    let history = h.bus.message_history();
    let request = history
        .iter()
        .find(|m| m.message_type == MessageType::ImprovementRequested)
        .unwrap();
    assert_eq!(request.payload["improvement_id"], improvement_id.as_str());
    assert!(!request.payload["acceptance_criteria"].as_array().unwrap().is_empty());

    let completed = history
        .iter()
        .find(|m| m.message_type == MessageType::ImprovementCompleted)
        .unwrap();
    assert_eq!(completed.payload["improvement_id"], improvement_id.as_str());

    // The improvement round-trip closes back to completed.
    assert_eq!(h.moderator.phase().await, ProjectPhase::Completed);
}

// ── Universal invariants ─────────────────────────────────────────────────

#[tokio::test]
async fn exactly_one_approved_task_completed_per_completed_task() {
    let h = harness(vec![review(65, vec!["Missing tests"]), review(85, vec![])], false).await;
    h.orchestrator
        .run_project(&h.moderator, &Default::default())
        .await
        .unwrap();

    let state = h.moderator.state();
    let state = state.lock().await;
    for task in state.tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
        let matching = h
            .bus
            .message_history()
            .into_iter()
            .filter(|m| {
                m.message_type == MessageType::TaskCompleted
                    && m.payload["task_id"] == task.id.as_str()
                    && m.payload["approved"] == true
            })
            .count();
        assert_eq!(matching, 1);
    }
}

#[tokio::test]
async fn stale_iteration_is_ignored_as_late_duplicate() {
    let h = harness(vec![review(65, vec!["Missing tests"]), review(85, vec![])], false).await;
    h.orchestrator
        .run_project(&h.moderator, &Default::default())
        .await
        .unwrap();

    let before = h.bus.message_history().len();
    // Replay iteration 1 after iteration 2 was already reviewed.
    h.bus
        .send_from(
            TECHLEAD_ID,
            MessageType::PrSubmitted,
            MODERATOR_ID,
            json!({ "task_id": "task_001", "pr_number": 123, "pr_url": "u", "iteration": 1 }),
            Some("corr_task_001".to_string()),
            true,
        )
        .await;

    // Only the replayed message itself was appended; no review reaction.
    assert_eq!(h.bus.message_history().len(), before + 1);
}
