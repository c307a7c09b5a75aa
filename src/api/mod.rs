pub mod jobs;
pub mod providers;
pub mod wallets;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::claim::ClaimCoordinator;
use crate::config::MatchingConfig;
use crate::error::{DispatchError, Result};
use crate::lifecycle::Lifecycle;
use crate::matching::score::PriorityConfig;
use crate::matching::sync::SyncHandle;
use crate::model::JobStatus;
use crate::settlement::SettlementEngine;
use crate::store::JobStore;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn JobStore>,
    pub claims: Arc<ClaimCoordinator>,
    pub lifecycle: Arc<Lifecycle>,
    pub settlement: Arc<SettlementEngine>,
    pub sync: SyncHandle,
    pub priority: Arc<watch::Sender<PriorityConfig>>,
    pub matching: MatchingConfig,
    pub draining: Arc<AtomicBool>,
    pub started_at: DateTime<Utc>,
}

impl ApiState {
    /// New jobs and new claims are refused while the node drains;
    /// in-flight jobs keep moving.
    fn ensure_accepting(&self) -> Result<()> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(DispatchError::Draining);
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

fn classify(err: &DispatchError) -> (StatusCode, &'static str) {
    match err {
        DispatchError::JobNotFound(_) | DispatchError::ProviderNotFound(_) => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        DispatchError::AlreadyClaimed { .. } => (StatusCode::CONFLICT, "already_claimed"),
        DispatchError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
        DispatchError::WorkerBusy { .. } => (StatusCode::CONFLICT, "worker_busy"),
        DispatchError::TipRejected { .. } => (StatusCode::CONFLICT, "tip_rejected"),
        DispatchError::InsufficientBalance { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_balance")
        }
        DispatchError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        DispatchError::Draining => (StatusCode::SERVICE_UNAVAILABLE, "draining"),
        DispatchError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
        DispatchError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        DispatchError::LedgerCorruption(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "ledger_corruption")
        }
        DispatchError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let (status, kind) = classify(&self);
        if status.is_server_error() {
            tracing::error!(error = %self, kind, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
                kind,
            }),
        )
            .into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/jobs",
            post(jobs::create_job_handler).get(jobs::list_jobs_handler),
        )
        .route("/api/jobs/{id}", get(jobs::get_job_handler))
        .route("/api/jobs/{id}/claim", post(jobs::claim_job_handler))
        .route("/api/jobs/{id}/advance", post(jobs::advance_job_handler))
        .route("/api/jobs/{id}/cancel", post(jobs::cancel_job_handler))
        .route("/api/jobs/{id}/tip", post(jobs::tip_job_handler))
        .route("/api/jobs/{id}/settlement", get(jobs::settlement_handler))
        .route(
            "/api/providers",
            post(providers::upsert_provider_handler).get(providers::list_providers_handler),
        )
        .route(
            "/api/providers/{id}/heartbeat",
            post(providers::heartbeat_handler),
        )
        .route("/api/providers/{id}/jobs", get(providers::ranked_jobs_handler))
        .route("/api/providers/{id}/stream", get(providers::stream_handler))
        .route("/api/wallets/{kind}/{id}", get(wallets::wallet_handler))
        .route(
            "/api/wallets/{kind}/{id}/deposit",
            post(wallets::deposit_handler),
        )
        .route(
            "/api/config/priority",
            get(priority_config_handler).put(update_priority_config_handler),
        )
        .route("/api/status", get(status_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "API server failed");
    }
}

// ===== Status & priority config =====

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: i64,
    draining: bool,
    sessions: usize,
    jobs: HashMap<JobStatus, usize>,
    providers_total: usize,
    providers_online: usize,
    priority: PriorityConfig,
}

async fn status_handler(State(state): State<ApiState>) -> Result<Json<StatusResponse>> {
    let jobs = state.store.counts_by_status().await?;
    let providers = state.store.providers().await?;
    // Best effort: a stopped synchronizer should not take status down.
    let sessions = state.sync.session_count().await.unwrap_or(0);

    Ok(Json(StatusResponse {
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        draining: state.draining.load(Ordering::SeqCst),
        sessions,
        jobs,
        providers_online: providers.iter().filter(|p| p.online).count(),
        providers_total: providers.len(),
        priority: state.priority.borrow().clone(),
    }))
}

async fn priority_config_handler(State(state): State<ApiState>) -> Json<PriorityConfig> {
    Json(state.priority.borrow().clone())
}

#[derive(Deserialize)]
struct PriorityUpdateRequest {
    name: Option<String>,
    distance_weight: f64,
    price_weight: f64,
    rating_weight: f64,
    age_weight: f64,
}

/// Activate a new weight set. The version is bumped here, never supplied by
/// the caller; scans pick the new config up on their next pass.
async fn update_priority_config_handler(
    State(state): State<ApiState>,
    Json(req): Json<PriorityUpdateRequest>,
) -> Result<Json<PriorityConfig>> {
    let current = state.priority.borrow().clone();
    let candidate = PriorityConfig {
        name: req.name.unwrap_or(current.name),
        version: current.version + 1,
        distance_weight: req.distance_weight,
        price_weight: req.price_weight,
        rating_weight: req.rating_weight,
        age_weight: req.age_weight,
    };
    candidate.validate()?;

    state.priority.send_replace(candidate.clone());
    tracing::info!(
        name = %candidate.name,
        version = candidate.version,
        "Activated priority config"
    );

    Ok(Json(candidate))
}
