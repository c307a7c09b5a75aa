use std::net::SocketAddr;

use crate::error::{DispatchError, Result};
use crate::matching::score::PriorityConfig;
use crate::model::job::ServiceKind;

/// Commission rates by service category. Rates are snapshotted into each
/// settlement record at settlement time; editing the schedule never
/// rewrites history.
#[derive(Debug, Clone)]
pub struct CommissionSchedule {
    pub ride: f64,
    pub delivery: f64,
    pub shopping: f64,
}

impl Default for CommissionSchedule {
    fn default() -> Self {
        Self {
            ride: 0.20,
            delivery: 0.15,
            shopping: 0.10,
        }
    }
}

impl CommissionSchedule {
    pub fn rate_for(&self, service: ServiceKind) -> f64 {
        match service {
            ServiceKind::Ride => self.ride,
            ServiceKind::Delivery => self.delivery,
            ServiceKind::Shopping => self.shopping,
        }
    }

    /// Rates must be fractions in [0, 1).
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("ride", self.ride),
            ("delivery", self.delivery),
            ("shopping", self.shopping),
        ] {
            if !(0.0..1.0).contains(&rate) || !rate.is_finite() {
                return Err(DispatchError::InvalidRequest(format!(
                    "commission rate for {} must be in [0, 1), got {}",
                    name, rate
                )));
            }
        }
        Ok(())
    }
}

/// What happens to the booking hold when a job is cancelled after pickup.
/// The default keeps the hold and flags the job for manual review.
#[derive(Debug, Clone, Default)]
pub struct CancelPolicy {
    pub refund_after_pickup: bool,
}

/// Capacities for the pool synchronizer and its sessions.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Most jobs a single provider pool retains.
    pub pool_capacity: usize,
    /// Removed-id memory per pool; within this horizon nothing
    /// resurrects.
    pub tombstone_capacity: usize,
    /// Per-session event channel depth. A session that falls this far
    /// behind is dropped and must resubscribe.
    pub session_buffer: usize,
    /// Store change-feed ring size.
    pub feed_capacity: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 1_000,
            tombstone_capacity: 4_096,
            session_buffer: 256,
            feed_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    /// Bound on the store round-trip for a claim; past it the outcome is
    /// unknown and reported as such.
    pub claim_timeout_ms: u64,
    /// Heartbeat silence after which a provider is marked offline.
    pub provider_timeout_ms: u64,
    /// How often the liveness sweeper runs.
    pub sweep_interval_ms: u64,
    /// Minutes after completion during which a tip may still be added.
    pub tip_window_mins: i64,
    pub matching: MatchingConfig,
    pub commissions: CommissionSchedule,
    pub cancellation: CancelPolicy,
    /// The priority configuration active at startup.
    pub priority: PriorityConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            claim_timeout_ms: 2_000,
            provider_timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
            tip_window_mins: 24 * 60,
            matching: MatchingConfig::default(),
            commissions: CommissionSchedule::default(),
            cancellation: CancelPolicy::default(),
            priority: PriorityConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Startup validation across the nested sections.
    pub fn validate(&self) -> Result<()> {
        self.commissions.validate()?;
        self.priority.validate()?;
        if self.claim_timeout_ms == 0 {
            return Err(DispatchError::InvalidRequest(
                "claim_timeout_ms must be positive".to_string(),
            ));
        }
        if self.tip_window_mins < 0 {
            return Err(DispatchError::InvalidRequest(
                "tip_window_mins must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}
