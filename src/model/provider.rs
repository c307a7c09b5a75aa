use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::matching::geo::Coordinate;
use crate::model::job::ServiceKind;

/// Radius granted to providers that register implicitly via heartbeat.
pub const DEFAULT_SERVICE_RADIUS_KM: f64 = 10.0;

/// A mobile worker that can claim and perform jobs.
///
/// `current_job` is the one-job-at-a-time guard: a non-null value excludes
/// the provider from matching and fails further claims with WorkerBusy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub location: Option<Coordinate>,
    pub online: bool,
    pub capabilities: Vec<ServiceKind>,
    pub service_radius_km: f64,
    pub current_job: Option<Uuid>,
    pub last_seen: DateTime<Utc>,
}

impl Provider {
    pub fn new(id: Uuid, capabilities: Vec<ServiceKind>, service_radius_km: f64) -> Self {
        Self {
            id,
            location: None,
            online: false,
            capabilities,
            service_radius_km,
            current_job: None,
            last_seen: Utc::now(),
        }
    }

    /// Used when a heartbeat arrives for an unknown id: registered with
    /// every capability and the default radius until an explicit upsert
    /// narrows it.
    pub fn auto_registered(id: Uuid) -> Self {
        Self::new(
            id,
            vec![ServiceKind::Ride, ServiceKind::Delivery, ServiceKind::Shopping],
            DEFAULT_SERVICE_RADIUS_KM,
        )
    }

    pub fn accepts(&self, service: ServiceKind) -> bool {
        self.capabilities.contains(&service)
    }

    /// Online and not holding a job.
    pub fn is_available(&self) -> bool {
        self.online && self.current_job.is_none()
    }

    /// Heartbeat recency check, wall-clock based since heartbeats come in
    /// over the API.
    pub fn is_alive(&self, timeout_ms: u64, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.last_seen);
        elapsed.num_milliseconds() < timeout_ms as i64
    }
}
