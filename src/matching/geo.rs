use serde::{Deserialize, Serialize};

use crate::model::job::JobRequest;

/// Mean earth radius in km, spherical model.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84-ish lat/lng pair. No antimeridian or pole handling; service
/// areas are city-scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Great-circle distance between two coordinates in km (haversine).
pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Distance from a provider position to a job's pickup, if both sides have
/// a coordinate.
pub fn pickup_distance_km(position: Option<Coordinate>, job: &JobRequest) -> Option<f64> {
    match (position, job.pickup) {
        (Some(from), Some(to)) => Some(haversine_km(from, to)),
        _ => None,
    }
}

/// Keep the jobs whose pickup lies within `radius_km` of `position`,
/// annotated with the distance. Jobs or providers without a coordinate are
/// excluded, never an error.
pub fn filter_in_range(
    position: Option<Coordinate>,
    radius_km: f64,
    jobs: impl IntoIterator<Item = JobRequest>,
) -> Vec<(JobRequest, f64)> {
    jobs.into_iter()
        .filter_map(|job| {
            let distance = pickup_distance_km(position, &job)?;
            if distance <= radius_km {
                Some((job, distance))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::job::ServiceKind;
    use uuid::Uuid;

    fn job_at(pickup: Option<Coordinate>) -> JobRequest {
        JobRequest::new(Uuid::new_v4(), ServiceKind::Ride, pickup, None, 10_000)
    }

    #[test]
    fn zero_distance_for_identical_points() {
        let p = Coordinate::new(40.7128, -74.0060);
        assert!(haversine_km(p, p).abs() < 1e-9);
    }

    #[test]
    fn known_city_pair_distance() {
        // New York City to Los Angeles, roughly 3936 km great-circle.
        let nyc = Coordinate::new(40.7128, -74.0060);
        let la = Coordinate::new(34.0522, -118.2437);
        let d = haversine_km(nyc, la);
        assert!((d - 3936.0).abs() < 10.0, "got {}", d);
    }

    #[test]
    fn short_hop_distance() {
        // Points about 1.11 km apart (0.01 degrees of latitude).
        let a = Coordinate::new(40.0, -74.0);
        let b = Coordinate::new(40.01, -74.0);
        let d = haversine_km(a, b);
        assert!((d - 1.11).abs() < 0.01, "got {}", d);
    }

    #[test]
    fn symmetric() {
        let a = Coordinate::new(51.5074, -0.1278);
        let b = Coordinate::new(48.8566, 2.3522);
        assert!((haversine_km(a, b) - haversine_km(b, a)).abs() < 1e-9);
    }

    #[test]
    fn filter_keeps_in_radius_and_annotates() {
        let here = Coordinate::new(40.0, -74.0);
        let near = job_at(Some(Coordinate::new(40.01, -74.0)));
        let far = job_at(Some(Coordinate::new(41.0, -74.0)));
        let near_id = near.id;

        let result = filter_in_range(Some(here), 5.0, vec![near, far]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].0.id, near_id);
        assert!(result[0].1 > 0.0 && result[0].1 < 5.0);
    }

    #[test]
    fn missing_coordinates_exclude_silently() {
        let here = Coordinate::new(40.0, -74.0);
        let no_pickup = job_at(None);
        let with_pickup = job_at(Some(Coordinate::new(40.0, -74.0)));

        let result = filter_in_range(Some(here), 5.0, vec![no_pickup, with_pickup.clone()]);
        assert_eq!(result.len(), 1);

        let result = filter_in_range(None, 5.0, vec![with_pickup]);
        assert!(result.is_empty());
    }
}
