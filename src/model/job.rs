use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::matching::geo::Coordinate;

/// Service categories a job can belong to. Providers advertise the set they
/// accept; matching only offers a job to providers that cover its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Ride,
    Delivery,
    Shopping,
}

impl ServiceKind {
    pub fn parse(s: &str) -> Option<ServiceKind> {
        match s {
            "ride" => Some(ServiceKind::Ride),
            "delivery" => Some(ServiceKind::Delivery),
            "shopping" => Some(ServiceKind::Shopping),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKind::Ride => write!(f, "ride"),
            ServiceKind::Delivery => write!(f, "delivery"),
            ServiceKind::Shopping => write!(f, "shopping"),
        }
    }
}

/// Job lifecycle states. The happy path walks the variants in declaration
/// order; `Cancelled` is reachable from every non-terminal state.
///
/// Non-trip categories reuse the same ordinal positions under different
/// labels (`in_queue`/`shopping`/`delivering`), see [`JobStatus::label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Matched,
    Arriving,
    PickedUp,
    InProgress,
    Completed,
    Cancelled,
}

impl JobStatus {
    /// Position on the happy-path ladder. `Cancelled` sits outside the
    /// ladder and compares after everything else.
    pub fn ordinal(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Matched => 1,
            JobStatus::Arriving => 2,
            JobStatus::PickedUp => 3,
            JobStatus::InProgress => 4,
            JobStatus::Completed => 5,
            JobStatus::Cancelled => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// The next state on the happy path, if any.
    pub fn next(&self) -> Option<JobStatus> {
        match self {
            JobStatus::Pending => Some(JobStatus::Matched),
            JobStatus::Matched => Some(JobStatus::Arriving),
            JobStatus::Arriving => Some(JobStatus::PickedUp),
            JobStatus::PickedUp => Some(JobStatus::InProgress),
            JobStatus::InProgress => Some(JobStatus::Completed),
            JobStatus::Completed | JobStatus::Cancelled => None,
        }
    }

    /// Client-facing label for this state under a given service category.
    /// The in-service phases carry category-specific names at the same
    /// ordinal positions; everything else uses the canonical name.
    pub fn label(&self, service: ServiceKind) -> &'static str {
        match (self, service) {
            (JobStatus::Arriving, ServiceKind::Shopping) => "in_queue",
            (JobStatus::PickedUp, ServiceKind::Shopping) => "shopping",
            (JobStatus::InProgress, ServiceKind::Delivery)
            | (JobStatus::InProgress, ServiceKind::Shopping) => "delivering",
            (JobStatus::Pending, _) => "pending",
            (JobStatus::Matched, _) => "matched",
            (JobStatus::Arriving, _) => "arriving",
            (JobStatus::PickedUp, _) => "picked_up",
            (JobStatus::InProgress, _) => "in_progress",
            (JobStatus::Completed, _) => "completed",
            (JobStatus::Cancelled, _) => "cancelled",
        }
    }

    /// Parse a canonical name or any category synonym back to its state.
    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "matched" => Some(JobStatus::Matched),
            "arriving" | "in_queue" => Some(JobStatus::Arriving),
            "picked_up" | "shopping" => Some(JobStatus::PickedUp),
            "in_progress" | "delivering" => Some(JobStatus::InProgress),
            "completed" => Some(JobStatus::Completed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Matched => write!(f, "matched"),
            JobStatus::Arriving => write!(f, "arriving"),
            JobStatus::PickedUp => write!(f, "picked_up"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Who initiated a cancellation. Drives the refund policy matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelParty {
    Requester,
    Provider,
    System,
}

impl CancelParty {
    pub fn parse(s: &str) -> Option<CancelParty> {
        match s {
            "requester" => Some(CancelParty::Requester),
            "provider" => Some(CancelParty::Provider),
            "system" => Some(CancelParty::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for CancelParty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelParty::Requester => write!(f, "requester"),
            CancelParty::Provider => write!(f, "provider"),
            CancelParty::System => write!(f, "system"),
        }
    }
}

/// One requested unit of service, from creation to a terminal state.
///
/// Money fields are integer minor units (cents). `version` is a per-row
/// counter bumped by the store on every mutation; pool consumers use it to
/// de-duplicate and order change events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub provider_id: Option<Uuid>,
    pub status: JobStatus,
    pub service: ServiceKind,
    pub pickup: Option<Coordinate>,
    pub dropoff: Option<Coordinate>,
    pub price_cents: i64,
    pub final_price_cents: Option<i64>,
    pub surge_multiplier: f64,
    pub requester_rating: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<CancelParty>,
    pub manual_review: bool,
    pub version: u64,
}

impl JobRequest {
    pub fn new(
        requester_id: Uuid,
        service: ServiceKind,
        pickup: Option<Coordinate>,
        dropoff: Option<Coordinate>,
        price_cents: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester_id,
            provider_id: None,
            status: JobStatus::Pending,
            service,
            pickup,
            dropoff,
            price_cents,
            final_price_cents: None,
            surge_multiplier: 1.0,
            requester_rating: None,
            created_at: Utc::now(),
            claimed_at: None,
            terminal_at: None,
            cancel_reason: None,
            cancelled_by: None,
            manual_review: false,
            version: 0,
        }
    }

    pub fn with_rating(mut self, rating: f64) -> Self {
        self.requester_rating = Some(rating);
        self
    }

    pub fn with_surge(mut self, multiplier: f64) -> Self {
        self.surge_multiplier = multiplier;
        self
    }

    /// The label clients see for the current status under this job's
    /// service category.
    pub fn phase_label(&self) -> &'static str {
        self.status.label(self.service)
    }

    pub fn is_claimable(&self) -> bool {
        self.status == JobStatus::Pending && self.provider_id.is_none()
    }
}
