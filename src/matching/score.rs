use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::model::job::JobRequest;

/// Distance at which the distance component reaches zero.
const DISTANCE_HORIZON_KM: f64 = 20.0;
/// Price component ramps from this floor (major units)...
const PRICE_FLOOR: f64 = 50.0;
/// ...over this span.
const PRICE_SPAN: f64 = 500.0;
/// Age at which the freshness component reaches zero.
const AGE_HORIZON_HOURS: f64 = 2.0;
/// Neutral-positive stand-in when the requester has no rating yet.
const UNRATED_SCORE: f64 = 0.8;

/// Named, versioned weight set for the priority formula. Exactly one config
/// is active at a time; it is read at scan time, never pinned per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    pub name: String,
    pub version: u64,
    pub distance_weight: f64,
    pub price_weight: f64,
    pub rating_weight: f64,
    pub age_weight: f64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            version: 1,
            distance_weight: 0.30,
            price_weight: 0.25,
            rating_weight: 0.20,
            age_weight: 0.25,
        }
    }
}

impl PriorityConfig {
    /// Weights must each lie in [0, 1] and sum to at most 1, so the total
    /// score stays in [0, 1].
    pub fn validate(&self) -> Result<()> {
        let weights = [
            ("distance_weight", self.distance_weight),
            ("price_weight", self.price_weight),
            ("rating_weight", self.rating_weight),
            ("age_weight", self.age_weight),
        ];
        for (name, w) in weights {
            if !(0.0..=1.0).contains(&w) || !w.is_finite() {
                return Err(DispatchError::InvalidRequest(format!(
                    "{} must be in [0, 1], got {}",
                    name, w
                )));
            }
        }
        let sum: f64 = weights.iter().map(|(_, w)| w).sum();
        if sum > 1.0 + 1e-9 {
            return Err(DispatchError::InvalidRequest(format!(
                "weights must sum to at most 1, got {}",
                sum
            )));
        }
        Ok(())
    }
}

/// Per-component scores, each already clamped to [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub distance: f64,
    pub price: f64,
    pub rating: f64,
    pub age: f64,
}

/// A candidate job annotated with its distance and priority score for one
/// provider's view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredJob {
    pub job: JobRequest,
    pub distance_km: f64,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Score one candidate. Pure arithmetic, no I/O.
pub fn score_job(
    job: &JobRequest,
    distance_km: f64,
    config: &PriorityConfig,
    now: DateTime<Utc>,
) -> ScoredJob {
    let distance = clamp01(1.0 - distance_km / DISTANCE_HORIZON_KM);

    let price_major = job.price_cents as f64 / 100.0;
    let price = clamp01((price_major - PRICE_FLOOR) / PRICE_SPAN);

    let rating = match job.requester_rating {
        Some(r) => clamp01((r - 1.0) / 4.0),
        None => UNRATED_SCORE,
    };

    let age_hours = now
        .signed_duration_since(job.created_at)
        .num_milliseconds()
        .max(0) as f64
        / 3_600_000.0;
    let age = clamp01(1.0 - age_hours / AGE_HORIZON_HOURS);

    let score = distance * config.distance_weight
        + price * config.price_weight
        + rating * config.rating_weight
        + age * config.age_weight;

    ScoredJob {
        job: job.clone(),
        distance_km,
        score,
        breakdown: ScoreBreakdown {
            distance,
            price,
            rating,
            age,
        },
    }
}

/// Strict total order over scored candidates: score descending, then
/// distance ascending, then creation time ascending, then job id. The id
/// key means no two distinct jobs ever compare equal, so identical inputs
/// always produce identical orderings.
pub fn compare(a: &ScoredJob, b: &ScoredJob) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.distance_km.total_cmp(&b.distance_km))
        .then_with(|| a.job.created_at.cmp(&b.job.created_at))
        .then_with(|| a.job.id.cmp(&b.job.id))
}

/// Score and rank a geo-filtered candidate list for one provider.
pub fn rank(
    candidates: Vec<(JobRequest, f64)>,
    config: &PriorityConfig,
    now: DateTime<Utc>,
) -> Vec<ScoredJob> {
    let mut scored: Vec<ScoredJob> = candidates
        .into_iter()
        .map(|(job, distance_km)| score_job(&job, distance_km, config, now))
        .collect();
    scored.sort_by(compare);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::job::ServiceKind;
    use uuid::Uuid;

    fn job_priced(price_cents: i64) -> JobRequest {
        JobRequest::new(Uuid::new_v4(), ServiceKind::Ride, None, None, price_cents)
    }

    fn full_weight_on(component: &str) -> PriorityConfig {
        let mut cfg = PriorityConfig {
            name: "test".into(),
            version: 1,
            distance_weight: 0.0,
            price_weight: 0.0,
            rating_weight: 0.0,
            age_weight: 0.0,
        };
        match component {
            "distance" => cfg.distance_weight = 1.0,
            "price" => cfg.price_weight = 1.0,
            "rating" => cfg.rating_weight = 1.0,
            "age" => cfg.age_weight = 1.0,
            other => panic!("unknown component {}", other),
        }
        cfg
    }

    #[test]
    fn distance_component() {
        let cfg = full_weight_on("distance");
        let job = job_priced(10_000);
        let now = Utc::now();
        let s = score_job(&job, 1.2, &cfg, now);
        assert!((s.breakdown.distance - 0.94).abs() < 1e-9);
        assert!((s.score - 0.94).abs() < 1e-9);
        // Beyond the horizon the component bottoms out at zero.
        assert_eq!(score_job(&job, 25.0, &cfg, now).score, 0.0);
    }

    #[test]
    fn price_component() {
        let cfg = full_weight_on("price");
        let now = Utc::now();
        // 150.00 -> (150 - 50) / 500 = 0.2
        let s = score_job(&job_priced(15_000), 0.0, &cfg, now);
        assert!((s.breakdown.price - 0.2).abs() < 1e-9);
        // Below the floor clamps to zero, far above clamps to one.
        assert_eq!(score_job(&job_priced(3_000), 0.0, &cfg, now).score, 0.0);
        assert_eq!(score_job(&job_priced(200_000), 0.0, &cfg, now).score, 1.0);
    }

    #[test]
    fn rating_component_with_default() {
        let cfg = full_weight_on("rating");
        let now = Utc::now();
        let rated = job_priced(10_000).with_rating(4.8);
        let s = score_job(&rated, 0.0, &cfg, now);
        assert!((s.breakdown.rating - 0.95).abs() < 1e-9);

        let unrated = job_priced(10_000);
        let s = score_job(&unrated, 0.0, &cfg, now);
        assert!((s.breakdown.rating - 0.8).abs() < 1e-9);
    }

    #[test]
    fn age_component_decays_to_zero() {
        let cfg = full_weight_on("age");
        let now = Utc::now();
        let fresh = job_priced(10_000);
        assert!(score_job(&fresh, 0.0, &cfg, now).breakdown.age > 0.999);

        let mut stale = job_priced(10_000);
        stale.created_at = now - chrono::Duration::hours(3);
        assert_eq!(score_job(&stale, 0.0, &cfg, now).breakdown.age, 0.0);

        let mut hour_old = job_priced(10_000);
        hour_old.created_at = now - chrono::Duration::hours(1);
        let s = score_job(&hour_old, 0.0, &cfg, now);
        assert!((s.breakdown.age - 0.5).abs() < 1e-3);
    }

    #[test]
    fn ranking_is_deterministic() {
        let cfg = PriorityConfig::default();
        let now = Utc::now();
        let jobs: Vec<(JobRequest, f64)> = (0..20)
            .map(|i| (job_priced(5_000 + i * 1_000), (i as f64) * 0.7))
            .collect();

        let first = rank(jobs.clone(), &cfg, now);
        let second = rank(jobs, &cfg, now);
        let ids: Vec<_> = first.iter().map(|s| s.job.id).collect();
        let ids2: Vec<_> = second.iter().map(|s| s.job.id).collect();
        assert_eq!(ids, ids2);
    }

    #[test]
    fn tie_breaks_form_a_total_order() {
        let cfg = PriorityConfig::default();
        let now = Utc::now();

        // Identical twins: same price, same distance, same creation time.
        // Only the id key separates them, and it must do so consistently.
        let mut a = job_priced(10_000);
        let mut b = job_priced(10_000);
        let t = now - chrono::Duration::minutes(5);
        a.created_at = t;
        b.created_at = t;

        let sa = score_job(&a, 2.0, &cfg, now);
        let sb = score_job(&b, 2.0, &cfg, now);
        assert_ne!(compare(&sa, &sb), Ordering::Equal);
        assert_eq!(compare(&sa, &sb), compare(&sb, &sa).reverse());

        // Same score, closer wins.
        let close = score_job(&a, 1.0, &full_weight_on("price"), now);
        let far = score_job(&b, 3.0, &full_weight_on("price"), now);
        assert_eq!(compare(&close, &far), Ordering::Less);
    }

    #[test]
    fn higher_score_sorts_first() {
        let cfg = full_weight_on("price");
        let now = Utc::now();
        let cheap = job_priced(6_000);
        let rich = job_priced(40_000);
        let ranked = rank(vec![(cheap, 1.0), (rich.clone(), 1.0)], &cfg, now);
        assert_eq!(ranked[0].job.id, rich.id);
    }

    #[test]
    fn weight_validation() {
        assert!(PriorityConfig::default().validate().is_ok());

        let mut cfg = PriorityConfig::default();
        cfg.distance_weight = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = PriorityConfig::default();
        cfg.distance_weight = 0.6;
        cfg.price_weight = 0.6;
        assert!(cfg.validate().is_err());

        let mut cfg = PriorityConfig::default();
        cfg.age_weight = -0.1;
        assert!(cfg.validate().is_err());
    }
}
