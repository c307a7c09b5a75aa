use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::api::ApiState;
use crate::error::{DispatchError, Result};
use crate::matching::geo::Coordinate;
use crate::matching::pool::{JobPool, PoolDelta, PoolEntry};
use crate::matching::score::ScoreBreakdown;
use crate::model::provider::DEFAULT_SERVICE_RADIUS_KM;
use crate::model::{JobRequest, Provider, ServiceKind};

type SseItem = std::result::Result<Event, Infallible>;

#[derive(Deserialize)]
pub struct UpsertProviderRequest {
    pub id: Option<Uuid>,
    pub capabilities: Vec<ServiceKind>,
    #[serde(default)]
    pub service_radius_km: Option<f64>,
    #[serde(default)]
    pub location: Option<Coordinate>,
    #[serde(default)]
    pub online: Option<bool>,
}

/// Create or update a provider profile. Assignment state is never touched
/// from here; claims own it.
pub async fn upsert_provider_handler(
    State(state): State<ApiState>,
    Json(req): Json<UpsertProviderRequest>,
) -> Result<(StatusCode, Json<Provider>)> {
    if req.capabilities.is_empty() {
        return Err(DispatchError::InvalidRequest(
            "provider needs at least one service capability".to_string(),
        ));
    }
    let radius = req.service_radius_km.unwrap_or(DEFAULT_SERVICE_RADIUS_KM);
    if !radius.is_finite() || radius <= 0.0 {
        return Err(DispatchError::InvalidRequest(format!(
            "service radius must be positive, got {}",
            radius
        )));
    }

    let id = req.id.unwrap_or_else(Uuid::new_v4);
    let (mut provider, created) = match state.store.provider(id).await {
        Ok(existing) => (existing, false),
        Err(DispatchError::ProviderNotFound(_)) => {
            (Provider::new(id, Vec::new(), radius), true)
        }
        Err(e) => return Err(e),
    };

    provider.capabilities = req.capabilities;
    provider.service_radius_km = radius;
    if let Some(location) = req.location {
        provider.location = Some(location);
    }
    if let Some(online) = req.online {
        provider.online = online;
    }
    provider.last_seen = Utc::now();

    let provider = state.store.upsert_provider(provider).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(provider)))
}

pub async fn list_providers_handler(
    State(state): State<ApiState>,
) -> Result<Json<Vec<Provider>>> {
    Ok(Json(state.store.providers().await?))
}

#[derive(Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub location: Option<Coordinate>,
    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

pub async fn heartbeat_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<Provider>> {
    let provider = state
        .store
        .record_heartbeat(id, req.location, req.online, Utc::now())
        .await?;
    // Going offline ends any live feed session; the stream sees its
    // channel close and tells the client to resubscribe.
    if !provider.online {
        state.sync.disconnect(id).await;
    }
    Ok(Json(provider))
}

/// A claimable job as one provider sees it: row, label, distance, score.
#[derive(Serialize)]
pub struct RankedJobView {
    #[serde(flatten)]
    pub job: JobRequest,
    pub phase: &'static str,
    pub distance_km: f64,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// One-shot ranked scan of the claimable set for this provider, highest
/// priority first. A busy or offline provider sees an empty list; the
/// streaming variant lives at `/stream`.
pub async fn ranked_jobs_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<RankedJobView>>> {
    let provider = state.store.provider(id).await?;
    let snapshot = state.store.pending_jobs().await?;

    let mut pool = JobPool::with_capacity(
        provider,
        state.matching.pool_capacity,
        state.matching.tombstone_capacity,
    );
    pool.seed(snapshot);

    let config = state.priority.borrow().clone();
    let ranked = pool
        .ranked(&config, Utc::now())
        .into_iter()
        .map(|scored| RankedJobView {
            phase: scored.job.phase_label(),
            job: scored.job,
            distance_km: scored.distance_km,
            score: scored.score,
            breakdown: scored.breakdown,
        })
        .collect();

    Ok(Json(ranked))
}

#[derive(Serialize)]
struct OfferPayload {
    #[serde(flatten)]
    job: JobRequest,
    phase: &'static str,
    distance_km: f64,
}

impl From<PoolEntry> for OfferPayload {
    fn from(entry: PoolEntry) -> Self {
        Self {
            phase: entry.job.phase_label(),
            job: entry.job,
            distance_km: entry.distance_km,
        }
    }
}

#[derive(Serialize)]
struct WithdrawPayload {
    job_id: Uuid,
}

#[derive(Serialize)]
struct ResetPayload {
    reason: &'static str,
}

async fn send_event<T: Serialize>(
    tx: &mpsc::Sender<SseItem>,
    name: &'static str,
    payload: &T,
) -> std::result::Result<(), ()> {
    let event = match Event::default().event(name).json_data(payload) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(event = name, error = %e, "Dropping unserializable stream event");
            return Ok(());
        }
    };
    tx.send(Ok(event)).await.map_err(|_| ())
}

/// SSE job feed. The session owns its pool: the synchronizer only relays
/// raw change events, and this task folds them into offers and
/// withdrawals for exactly one provider. Busy and offline providers are
/// refused up front. A `reset` event means the server dropped the session
/// (lagging, shutdown, or the provider won a job) and the client must
/// resubscribe for a fresh snapshot.
pub async fn stream_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let subscription = state.sync.subscribe(id).await?;
    let mut pool = JobPool::with_capacity(
        subscription.provider,
        state.matching.pool_capacity,
        state.matching.tombstone_capacity,
    );
    let mut events = subscription.events;
    let snapshot = subscription.snapshot;

    let (tx, rx) = mpsc::channel::<SseItem>(state.matching.session_buffer);
    let sync = state.sync.clone();

    tokio::spawn(async move {
        for entry in pool.seed(snapshot) {
            if send_event(&tx, "offered", &OfferPayload::from(entry))
                .await
                .is_err()
            {
                sync.disconnect(id).await;
                return;
            }
        }

        while let Some(change) = events.recv().await {
            let sent = match pool.apply(&change) {
                Some(PoolDelta::Offered(entry)) => {
                    send_event(&tx, "offered", &OfferPayload::from(entry)).await
                }
                Some(PoolDelta::Updated(entry)) => {
                    send_event(&tx, "updated", &OfferPayload::from(entry)).await
                }
                Some(PoolDelta::Withdrawn(job_id)) => {
                    send_event(&tx, "withdrawn", &WithdrawPayload { job_id }).await
                }
                Some(PoolDelta::Suspended) => {
                    // This provider just won a job; the feed is over until
                    // it is free to claim again.
                    let _ = send_event(
                        &tx,
                        "reset",
                        &ResetPayload {
                            reason: "job assigned, resubscribe when available",
                        },
                    )
                    .await;
                    sync.disconnect(id).await;
                    return;
                }
                None => Ok(()),
            };
            if sent.is_err() {
                // Client went away.
                sync.disconnect(id).await;
                return;
            }
        }

        // The synchronizer closed the channel: it dropped this session as
        // lagging, or the node is shutting down.
        let _ = send_event(
            &tx,
            "reset",
            &ResetPayload {
                reason: "session dropped, resubscribe for a fresh snapshot",
            },
        )
        .await;
        sync.disconnect(id).await;
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}
