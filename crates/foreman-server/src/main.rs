mod logging;
mod routes;

use std::{
    collections::VecDeque,
    sync::Arc,
    time::Instant,
};

use anyhow::{bail, Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use foreman_agents::backend::CliBackend;
use foreman_agents::moderator::Moderator;
use foreman_agents::monitor::Monitor;
use foreman_agents::orchestrator::Orchestrator;
use foreman_agents::techlead::TechLead;
use foreman_analyzers::{AnalyzerPipeline, ImprovementEngine};
use foreman_core::bus::MessageBus;
use foreman_core::config::Config;
use foreman_core::db::LearningDb;
use foreman_core::decompose::{Decomposer, SimpleDecomposer};
use foreman_core::executor::SequentialExecutor;
use foreman_core::gitops::ShellGit;
use foreman_core::review::PrReviewer;
use foreman_core::state::ProjectStore;
use foreman_core::types::{ProjectPhase, ProjectState};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub gear: u8,
    pub bus: Arc<MessageBus>,
    pub project: Arc<TokioMutex<ProjectState>>,
    pub monitor: Option<Arc<Monitor>>,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(routes::get_status))
        .route("/api/project", get(routes::get_project))
        .route("/api/messages", get(routes::get_messages))
        .route("/api/health", get(routes::get_health))
        .route("/api/health/history", get(routes::get_health_history))
        .route("/api/metrics", get(routes::get_metrics))
        .route("/api/metrics/summary", get(routes::get_metrics_summary))
        .route("/api/alerts", get(routes::get_alerts))
        .route("/api/alerts/summary", get(routes::get_alerts_summary))
        .route("/api/alerts/counts", get(routes::get_alert_counts))
        .route("/api/alerts/:id/ack", post(routes::ack_alert))
        .route("/api/logs", get(routes::get_logs))
        .route("/api/logs/stream", get(routes::stream_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let (log_tx, _log_rx) = broadcast::channel::<String>(1024);
    let log_ring: Arc<std::sync::Mutex<VecDeque<String>>> =
        Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(500)));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "foreman_server=info,foreman_core=info,foreman_agents=info,foreman_analyzers=info,tower_http=warn"
            .into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::DashboardLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env()?;
    if !(1..=3).contains(&config.gear) {
        bail!("FOREMAN_GEAR must be 1, 2, or 3 (got {})", config.gear);
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let db = Arc::new(LearningDb::open(&format!("{}/foreman.db", config.data_dir))?);
    db.migrate()?;

    let store = Arc::new(ProjectStore::new(&config.state_dir)?);

    // Resume the named project if it exists; otherwise start fresh.
    let project_id = if config.project_id.is_empty() {
        format!("proj_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
    } else {
        config.project_id.clone()
    };
    let project = match store.load_project(&project_id)? {
        Some(existing) => {
            info!(project_id, "resuming existing project");
            existing
        }
        None => {
            if config.requirements.trim().is_empty() {
                bail!("FOREMAN_REQUIREMENTS is required for a new project");
            }
            ProjectState::new(project_id.clone(), config.requirements.clone())
        }
    };
    let project = Arc::new(TokioMutex::new(project));

    let bus = Arc::new(MessageBus::new());
    let backend = Arc::new(
        CliBackend::new(config.backend_cmd.clone()).with_timeout(config.backend_timeout_s),
    );
    let git = Arc::new(ShellGit::new(config.repo_path.clone()));

    // ── Gear 1: sequential, agentless ────────────────────────────────────
    if config.gear == 1 {
        let executor = SequentialExecutor::new(backend, git, Arc::clone(&store));
        let mut state = project.lock().await;
        let decomposed = SimpleDecomposer.decompose(&state.requirements)?;
        if state.tasks.is_empty() {
            state.tasks = decomposed;
        }
        let result = executor.execute_all(&mut state).await;
        let phase = state.phase;
        drop(state);
        if let Err(e) = result {
            warn!("sequential execution failed: {e:#}");
        }
        info!(phase = ?phase, "gear 1 run finished");
        std::process::exit(if phase == ProjectPhase::Failed { 1 } else { 0 });
    }

    // ── Gear 2/3: agent orchestration ────────────────────────────────────
    let moderator = Arc::new(Moderator::new(
        Arc::clone(&bus),
        Arc::new(SimpleDecomposer),
        Arc::new(PrReviewer::new()),
        Arc::new(ImprovementEngine::new(AnalyzerPipeline::with_default_analyzers(), 1)),
        Arc::clone(&store),
        Arc::clone(&project),
        config.max_pr_iterations,
    ));
    let techlead = Arc::new(TechLead::new(
        Arc::clone(&bus),
        backend,
        git,
        Arc::clone(&store),
        Arc::clone(&project),
    ));

    let monitor = if config.gear == 3 {
        // Construction validates weights and thresholds; failures are fatal
        // before any agent starts.
        Some(Arc::new(Monitor::new(Arc::clone(&db), config.gear3.monitoring.clone())?))
    } else {
        None
    };

    let orchestrator = Orchestrator::new(Arc::clone(&bus));
    orchestrator.register(Arc::clone(&moderator) as _)?;
    orchestrator.register(techlead as _)?;
    if let Some(ref monitor) = monitor {
        orchestrator.register(Arc::clone(monitor) as _)?;
    }
    orchestrator.start_agents().await?;

    // Dashboard
    let app_state = Arc::new(AppState {
        gear: config.gear,
        bus: Arc::clone(&bus),
        project: Arc::clone(&project),
        monitor: monitor.clone(),
        start_time: Instant::now(),
        log_tx: log_tx.clone(),
        log_ring: Arc::clone(&log_ring),
    });
    let bind = format!("{}:{}", config.web_bind, config.web_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding dashboard to {bind}"))?;
    info!(bind, "dashboard listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(app_state)).await {
            warn!("dashboard server exited: {e}");
        }
    });

    // Drive the project to a terminal phase. Everything after the first
    // assignment is event-driven.
    let phase = orchestrator
        .run_project(&moderator, &config.gear3.ever_thinker)
        .await?;
    info!(phase = ?phase, "project reached terminal phase");

    // Keep serving the dashboard (and the monitor daemon) until interrupted.
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    orchestrator.stop_agents().await;

    std::process::exit(if phase == ProjectPhase::Failed { 1 } else { 0 });
}
