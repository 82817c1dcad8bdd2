use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    config::{ConsoleConfig, PollPolicy},
    controller::{ScanJobController, ScanOutcome},
    error::ScanError,
    health::HealthPoller,
    history::SecurityDashboard,
    quick::QuickCheckRunner,
    service::{ApiClient, MonitoringService, ScanService},
    types::{NormalizedScan, ScanJob, ScanKind},
};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<ConsoleState>,
}

struct ConsoleState {
    scans: Arc<dyn ScanService>,
    controller: ScanJobController<dyn ScanService>,
    quick: QuickCheckRunner<dyn ScanService>,
    health: HealthPoller<dyn MonitoringService>,
    jobs: RwLock<JobBoard>,
}

/// Settled jobs kept for clients to read back before the oldest are dropped.
pub const SETTLED_JOB_LIMIT: usize = 256;

/// Jobs started through this console. Running jobs are always kept;
/// settled ones are evicted oldest first past `settled_limit`.
struct JobBoard {
    entries: HashMap<String, JobEntry>,
    settled: VecDeque<String>,
    settled_limit: usize,
}

impl JobBoard {
    fn new(settled_limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            settled: VecDeque::new(),
            settled_limit,
        }
    }

    fn track(&mut self, job_id: String, entry: JobEntry) {
        self.settled.retain(|id| *id != job_id);
        self.entries.insert(job_id, entry);
    }

    fn settle(&mut self, job_id: &str, outcome: JobOutcome) {
        let Some(entry) = self.entries.get_mut(job_id) else {
            warn!(%job_id, "finished job no longer tracked");
            return;
        };
        entry.outcome = Some(outcome);
        self.settled.push_back(job_id.to_string());
        while self.settled.len() > self.settled_limit {
            if let Some(oldest) = self.settled.pop_front() {
                self.entries.remove(&oldest);
                debug!(job_id = %oldest, "evicted settled job");
            }
        }
    }

    fn get(&self, job_id: &str) -> Option<&JobEntry> {
        self.entries.get(job_id)
    }
}

struct JobEntry {
    snapshot: watch::Receiver<ScanJob>,
    cancel: CancellationToken,
    outcome: Option<JobOutcome>,
}

impl JobEntry {
    fn view(&self) -> JobView {
        JobView {
            job: self.snapshot.borrow().clone(),
            cancelled: match &self.outcome {
                Some(outcome) => matches!(outcome, JobOutcome::Cancelled),
                None => self.cancel.is_cancelled(),
            },
            outcome: self.outcome.clone(),
        }
    }
}

/// How a job ended, as reported to API clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { scan: Arc<NormalizedScan> },
    Failed { error: String, retry_later: bool },
    Cancelled,
}

impl From<ScanOutcome> for JobOutcome {
    fn from(outcome: ScanOutcome) -> Self {
        match outcome {
            Ok(scan) => JobOutcome::Completed { scan },
            Err(ScanError::Cancelled { .. }) => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed {
                retry_later: e.is_retryable_later(),
                error: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job: ScanJob,
    pub cancelled: bool,
    pub outcome: Option<JobOutcome>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckRequest {
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ScanError {
    fn into_response(self) -> Response {
        let status = match &self {
            ScanError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ScanError::Cancelled { .. } => StatusCode::CONFLICT,
            _ => StatusCode::BAD_GATEWAY,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

impl AppState {
    pub fn new(
        scans: Arc<dyn ScanService>,
        monitoring: Arc<dyn MonitoringService>,
        policy: PollPolicy,
    ) -> Self {
        Self::with_settled_limit(scans, monitoring, policy, SETTLED_JOB_LIMIT)
    }

    pub fn with_settled_limit(
        scans: Arc<dyn ScanService>,
        monitoring: Arc<dyn MonitoringService>,
        policy: PollPolicy,
        settled_limit: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ConsoleState {
                controller: ScanJobController::new(Arc::clone(&scans), policy),
                quick: QuickCheckRunner::new(Arc::clone(&scans)),
                health: HealthPoller::new(monitoring),
                scans,
                jobs: RwLock::new(JobBoard::new(settled_limit)),
            }),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/targets/{id}/scan", post(post_scan))
        .route("/targets/{id}/quick", post(post_quick))
        .route("/targets/{id}/security", get(get_security))
        .route("/jobs/{job_id}", get(get_job).delete(cancel_job))
        .route("/health", get(get_health))
        .route("/health/check", post(post_check_all))
        .route("/health/{id}/check", post(post_check_one))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

pub async fn spawn_server(config: &ConsoleConfig) -> Result<()> {
    let client = Arc::new(ApiClient::new(&config.client)?);
    let state = AppState::new(client.clone(), client, config.poll);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(bind = %config.bind, api = %config.client.base_url, "console API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn post_scan(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    let handle = match app.inner.controller.start(&id, ScanKind::Full).await {
        Ok(handle) => handle,
        Err(e) => return e.into_response(),
    };

    let job_id = handle.id().to_string();
    let entry = JobEntry {
        snapshot: handle.subscribe(),
        cancel: handle.cancel_token(),
        outcome: None,
    };
    let view = entry.view();
    app.inner.jobs.write().await.track(job_id.clone(), entry);

    // Record the outcome once the job settles
    let app2 = app.clone();
    tokio::spawn(async move {
        let outcome = JobOutcome::from(handle.wait().await);
        app2.inner.jobs.write().await.settle(&job_id, outcome);
    });

    (StatusCode::ACCEPTED, Json(view)).into_response()
}

async fn post_quick(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    match app.inner.quick.run(&id).await {
        Ok(scan) => (StatusCode::OK, Json(scan)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_security(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    match SecurityDashboard::load(app.inner.scans.as_ref(), &id).await {
        Ok(dashboard) => (StatusCode::OK, Json(dashboard)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_job(State(app): State<AppState>, Path(job_id): Path<String>) -> Response {
    let jobs = app.inner.jobs.read().await;
    match jobs.get(&job_id) {
        Some(entry) => (StatusCode::OK, Json(entry.view())).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn cancel_job(State(app): State<AppState>, Path(job_id): Path<String>) -> Response {
    let jobs = app.inner.jobs.read().await;
    match jobs.get(&job_id) {
        Some(entry) => {
            entry.cancel.cancel();
            info!(%job_id, "scan polling cancelled by client");
            (StatusCode::ACCEPTED, Json(entry.view())).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_health(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.inner.health.board().await))
}

async fn post_check_all(
    State(app): State<AppState>,
    Json(req): Json<CheckRequest>,
) -> Response {
    match app.inner.health.check_all(&req.targets).await {
        Ok(results) => (StatusCode::OK, Json(results)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn post_check_one(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    match app.inner.health.check_one(&id).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => e.into_response(),
    }
}
