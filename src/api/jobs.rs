use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ApiState;
use crate::error::{DispatchError, Result};
use crate::matching::geo::Coordinate;
use crate::model::{CancelParty, JobRequest, JobStatus, ServiceKind, SettlementRecord};
use crate::settlement::FareInputs;

/// Job row plus the category-specific label clients display.
#[derive(Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: JobRequest,
    pub phase: &'static str,
}

impl From<JobRequest> for JobView {
    fn from(job: JobRequest) -> Self {
        let phase = job.phase_label();
        Self { job, phase }
    }
}

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub requester_id: Uuid,
    pub service: ServiceKind,
    #[serde(default)]
    pub pickup: Option<Coordinate>,
    #[serde(default)]
    pub dropoff: Option<Coordinate>,
    pub price_cents: i64,
    #[serde(default)]
    pub surge_multiplier: Option<f64>,
    #[serde(default)]
    pub requester_rating: Option<f64>,
}

pub async fn create_job_handler(
    State(state): State<ApiState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobView>)> {
    state.ensure_accepting()?;

    if let Some(m) = req.surge_multiplier {
        if !m.is_finite() || m < 1.0 {
            return Err(DispatchError::InvalidRequest(format!(
                "surge multiplier must be at least 1.0, got {}",
                m
            )));
        }
    }
    if let Some(r) = req.requester_rating {
        if !(1.0..=5.0).contains(&r) {
            return Err(DispatchError::InvalidRequest(format!(
                "requester rating must be in [1, 5], got {}",
                r
            )));
        }
    }

    let mut job = JobRequest::new(
        req.requester_id,
        req.service,
        req.pickup,
        req.dropoff,
        req.price_cents,
    );
    if let Some(m) = req.surge_multiplier {
        job = job.with_surge(m);
    }
    if let Some(r) = req.requester_rating {
        job = job.with_rating(r);
    }

    let job = state.settlement.book(job).await?;
    tracing::info!(job_id = %job.id, service = %job.service, "Job created");

    Ok((StatusCode::CREATED, Json(job.into())))
}

#[derive(Deserialize)]
pub struct PageParams {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct JobPage {
    pub jobs: Vec<JobView>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

pub async fn list_jobs_handler(
    State(state): State<ApiState>,
    Query(params): Query<PageParams>,
) -> Result<Json<JobPage>> {
    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(50).min(500);
    let (jobs, total) = state.store.jobs_page(offset, limit).await?;

    Ok(Json(JobPage {
        jobs: jobs.into_iter().map(JobView::from).collect(),
        total,
        offset,
        limit,
    }))
}

pub async fn get_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>> {
    Ok(Json(state.store.job(id).await?.into()))
}

#[derive(Deserialize)]
pub struct ClaimRequest {
    pub provider_id: Uuid,
}

#[derive(Serialize)]
pub struct ClaimResponse {
    pub outcome: &'static str,
    pub job: JobView,
}

/// Winner-take-all. Losers get a conflict, not a stack trace.
pub async fn claim_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>> {
    state.ensure_accepting()?;

    let job = state.claims.claim(id, req.provider_id).await?;
    Ok(Json(ClaimResponse {
        outcome: "won",
        job: job.into(),
    }))
}

#[derive(Deserialize)]
pub struct AdvanceRequest {
    /// Target status; category synonyms like "delivering" are accepted.
    pub target: String,
    #[serde(default)]
    pub fare: Option<FareInputs>,
}

pub async fn advance_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AdvanceRequest>,
) -> Result<Json<JobView>> {
    let target = JobStatus::parse(&req.target).ok_or_else(|| {
        DispatchError::InvalidRequest(format!("unknown target status '{}'", req.target))
    })?;

    let job = state.lifecycle.advance(id, target, req.fare).await?;
    Ok(Json(job.into()))
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub party: CancelParty,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<JobView>> {
    let reason = req.reason.unwrap_or_else(|| "unspecified".to_string());
    let job = state.lifecycle.cancel(id, req.party, reason).await?;
    Ok(Json(job.into()))
}

#[derive(Deserialize)]
pub struct TipRequest {
    pub amount_cents: i64,
}

pub async fn tip_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TipRequest>,
) -> Result<Json<SettlementRecord>> {
    let record = state.settlement.tip(id, req.amount_cents).await?;
    Ok(Json(record))
}

pub async fn settlement_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SettlementRecord>> {
    Ok(Json(state.store.settlement(id).await?))
}
