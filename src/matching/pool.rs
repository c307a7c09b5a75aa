use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::matching::geo;
use crate::matching::score::{self, PriorityConfig, ScoredJob};
use crate::model::{JobRequest, Provider};
use crate::store::ChangeEvent;

pub const DEFAULT_MAX_ENTRIES: usize = 1_000;
pub const DEFAULT_MAX_TOMBSTONES: usize = 4_096;

/// A candidate job held in a provider's pool, annotated with the pickup
/// distance computed at admission.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub job: JobRequest,
    pub distance_km: f64,
}

/// Outward-visible change produced by applying one feed event.
#[derive(Debug, Clone)]
pub enum PoolDelta {
    Offered(PoolEntry),
    /// A live entry changed (newer version, still admissible). Clients
    /// replace the row instead of treating it as a new offer.
    Updated(PoolEntry),
    Withdrawn(Uuid),
    /// This pool's provider was assigned a job. The pool has emptied and
    /// stays empty; the session should end and the provider resubscribes
    /// for a fresh snapshot once free again.
    Suspended,
}

/// One provider's view of the claimable jobs near it.
///
/// Owned exclusively by that provider's session task; all mutation happens
/// through [`JobPool::apply`] on events from the synchronizer. Arrival
/// order is untrusted: each entry remembers its row version, and removed
/// ids are tombstoned so a stale insert can never resurrect a job the pool
/// already saw leave.
#[derive(Debug)]
pub struct JobPool {
    provider: Provider,
    entries: HashMap<Uuid, PoolEntry>,
    tombstones: HashMap<Uuid, u64>,
    max_entries: usize,
    max_tombstones: usize,
}

impl JobPool {
    pub fn new(provider: Provider) -> Self {
        Self::with_capacity(provider, DEFAULT_MAX_ENTRIES, DEFAULT_MAX_TOMBSTONES)
    }

    pub fn with_capacity(provider: Provider, max_entries: usize, max_tombstones: usize) -> Self {
        Self {
            provider,
            entries: HashMap::new(),
            tombstones: HashMap::new(),
            max_entries,
            max_tombstones,
        }
    }

    /// Distance to the job's pickup if this pool would admit it: provider
    /// online and unassigned, job claimable, capability match, both
    /// coordinates present and within radius.
    fn admit_distance(&self, job: &JobRequest) -> Option<f64> {
        if !self.provider.is_available() {
            return None;
        }
        if !job.is_claimable() || !self.provider.accepts(job.service) {
            return None;
        }
        let distance = geo::pickup_distance_km(self.provider.location, job)?;
        if distance <= self.provider.service_radius_km {
            Some(distance)
        } else {
            None
        }
    }

    /// Seed from a reconciling snapshot. Call before applying incremental
    /// events; versions recorded here protect against older events still in
    /// flight.
    pub fn seed(&mut self, snapshot: Vec<JobRequest>) -> Vec<PoolEntry> {
        let mut admitted = Vec::new();
        for job in snapshot {
            if self.entries.len() >= self.max_entries {
                break;
            }
            if let Some(distance_km) = self.admit_distance(&job) {
                let entry = PoolEntry { job, distance_km };
                self.entries.insert(entry.job.id, entry.clone());
                admitted.push(entry);
            }
        }
        admitted
    }

    /// Apply one change-feed event. Returns the visible delta, if any.
    pub fn apply(&mut self, event: &ChangeEvent) -> Option<PoolDelta> {
        let job = &event.job;
        let id = job.id;

        // Once removed, an id never re-enters this pool. Track the newest
        // version seen so later duplicates stay stale too.
        if let Some(seen) = self.tombstones.get_mut(&id) {
            *seen = (*seen).max(job.version);
            return None;
        }

        // An assignment to this provider makes it busy: one job at a time,
        // so no entry here is claimable by it anymore.
        if job.provider_id == Some(self.provider.id) && !job.status.is_terminal() {
            self.provider.current_job = Some(id);
            self.entries.clear();
            self.remember_removed(id, job.version);
            return Some(PoolDelta::Suspended);
        }

        if let Some(existing) = self.entries.get(&id) {
            if job.version <= existing.job.version {
                return None;
            }
            if let Some(distance_km) = self.admit_distance(job) {
                let entry = PoolEntry {
                    job: job.clone(),
                    distance_km,
                };
                self.entries.insert(id, entry.clone());
                return Some(PoolDelta::Updated(entry));
            }
            self.entries.remove(&id);
            self.remember_removed(id, job.version);
            return Some(PoolDelta::Withdrawn(id));
        }

        match self.admit_distance(job) {
            Some(distance_km) => {
                if self.entries.len() >= self.max_entries {
                    return None;
                }
                let entry = PoolEntry {
                    job: job.clone(),
                    distance_km,
                };
                self.entries.insert(id, entry.clone());
                Some(PoolDelta::Offered(entry))
            }
            None => {
                // A removal can outrun the insert it follows. Tombstone
                // jobs that left the claimable set so the late insert is
                // discarded on arrival. Claimable jobs this pool merely
                // filters out (capability, radius, availability) stay
                // untracked; they are not gone, just not offered here.
                if !job.is_claimable() {
                    self.remember_removed(id, job.version);
                }
                None
            }
        }
    }

    fn remember_removed(&mut self, id: Uuid, version: u64) {
        self.tombstones.insert(id, version);
        if self.tombstones.len() > self.max_tombstones {
            // Evict the oldest tombstone by version.
            if let Some(oldest) = self
                .tombstones
                .iter()
                .min_by_key(|(_, v)| **v)
                .map(|(k, _)| *k)
            {
                self.tombstones.remove(&oldest);
            }
        }
    }

    /// Current pool contents scored and ordered for this provider.
    pub fn ranked(&self, config: &PriorityConfig, now: DateTime<Utc>) -> Vec<ScoredJob> {
        let candidates = self
            .entries
            .values()
            .map(|e| (e.job.clone(), e.distance_km))
            .collect();
        score::rank(candidates, config, now)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }
}
