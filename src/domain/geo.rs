//! Great-circle distance and zone membership

use crate::domain::types::WorkZone;
use thiserror::Error;

/// Mean Earth radius used by the haversine formula
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Coordinate rejected before it reaches the store
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidCoordinate {
    #[error("latitude {0} out of range [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} out of range [-180, 180]")]
    Longitude(f64),
    #[error("coordinate is not a number: {0}")]
    NotANumber(String),
}

/// Check latitude/longitude ranges. NaN fails both range checks.
pub fn validate_coordinate(lat: f64, lon: f64) -> Result<(), InvalidCoordinate> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(InvalidCoordinate::Latitude(lat));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(InvalidCoordinate::Longitude(lon));
    }
    Ok(())
}

/// Haversine distance in meters. Inputs must already be validated.
pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

impl WorkZone {
    pub fn new(center_lat: f64, center_lon: f64, radius_m: f64) -> Self {
        Self { center_lat, center_lon, radius_m }
    }

    /// Distance from the zone center in meters
    pub fn distance_to(&self, lat: f64, lon: f64) -> f64 {
        distance_m(lat, lon, self.center_lat, self.center_lon)
    }

    /// Boundary is inclusive
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.distance_to(lat, lon) <= self.radius_m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORK: WorkZone = WorkZone { center_lat: 55.676803, center_lon: 37.523510, radius_m: 100.0 };

    #[test]
    fn test_distance_zero_at_center() {
        assert_eq!(distance_m(55.676803, 37.523510, 55.676803, 37.523510), 0.0);
    }

    #[test]
    fn test_distance_known_value() {
        // One degree of latitude is ~111.2 km on a 6371 km sphere
        let d = distance_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_194.9).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_distance_symmetric() {
        let a = distance_m(55.68, 37.53, 55.676803, 37.523510);
        let b = distance_m(55.676803, 37.523510, 55.68, 37.53);
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn test_zone_membership() {
        assert!(WORK.contains(55.676803, 37.523510));
        // ~500 m away
        assert!(!WORK.contains(55.6800, 37.5300));
    }

    #[test]
    fn test_zone_boundary_inclusive() {
        let d = WORK.distance_to(55.6800, 37.5300);
        let zone = WorkZone::new(WORK.center_lat, WORK.center_lon, d);
        assert!(zone.contains(55.6800, 37.5300));
    }

    #[test]
    fn test_validate_coordinate() {
        assert!(validate_coordinate(55.7, 37.6).is_ok());
        assert!(validate_coordinate(90.0, -180.0).is_ok());
        assert_eq!(validate_coordinate(91.0, 0.0), Err(InvalidCoordinate::Latitude(91.0)));
        assert_eq!(validate_coordinate(0.0, 180.5), Err(InvalidCoordinate::Longitude(180.5)));
        assert!(validate_coordinate(f64::NAN, 0.0).is_err());
    }
}
