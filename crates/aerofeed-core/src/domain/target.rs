use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::record::normalize_identity_key;
use crate::ValidationError;

const EARTH_RADIUS_NM: f64 = 3_440.065;

/// WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ValidationError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(ValidationError::InvalidLatitude {
                value: latitude.to_string(),
            });
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(ValidationError::InvalidLongitude {
                value: longitude.to_string(),
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Great-circle distance in nautical miles (haversine).
    pub fn distance_nm(self, other: GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_NM * a.sqrt().asin()
    }

    /// Axis-aligned box `(south, west, north, east)` enclosing a circle of `radius_nm`.
    pub fn bounding_box(self, radius_nm: f64) -> (f64, f64, f64, f64) {
        let dlat = radius_nm / 60.0;
        let cos_lat = self.latitude.to_radians().cos().abs().max(0.01);
        let dlon = (radius_nm / (60.0 * cos_lat)).min(180.0);

        (
            (self.latitude - dlat).max(-90.0),
            (self.longitude - dlon).max(-180.0),
            (self.latitude + dlat).min(90.0),
            (self.longitude + dlon).min(180.0),
        )
    }
}

/// Spatial/temporal filter for multi-entity lookups.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AreaFilter {
    pub center: GeoPoint,
    pub radius_nm: f64,
    /// Records observed longer ago than this are dropped.
    pub max_age: Option<Duration>,
}

impl AreaFilter {
    pub fn new(center: GeoPoint, radius_nm: f64) -> Result<Self, ValidationError> {
        if !radius_nm.is_finite() || radius_nm <= 0.0 {
            return Err(ValidationError::InvalidRadius {
                value: radius_nm.to_string(),
            });
        }
        Ok(Self {
            center,
            radius_nm,
            max_age: None,
        })
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        let point = GeoPoint {
            latitude,
            longitude,
        };
        self.center.distance_nm(point) <= self.radius_nm
    }
}

/// What an aggregator query asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryTarget {
    /// A single entity addressed by its source-independent identity key.
    Identity { key: String },
    /// Every entity inside an area.
    Area(AreaFilter),
}

impl QueryTarget {
    pub fn identity(key: impl AsRef<str>) -> Result<Self, ValidationError> {
        Ok(Self::Identity {
            key: normalize_identity_key(key.as_ref())?,
        })
    }

    pub fn area(filter: AreaFilter) -> Self {
        Self::Area(filter)
    }

    pub fn identity_key(&self) -> Option<&str> {
        match self {
            Self::Identity { key } => Some(key.as_str()),
            Self::Area(_) => None,
        }
    }
}

impl Display for QueryTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identity { key } => write!(f, "identity:{key}"),
            Self::Area(area) => write!(
                f,
                "area:{:.4},{:.4}r{}nm",
                area.center.latitude, area.center.longitude, area.radius_nm
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(matches!(
            GeoPoint::new(91.0, 0.0),
            Err(ValidationError::InvalidLatitude { .. })
        ));
        assert!(matches!(
            GeoPoint::new(0.0, -181.0),
            Err(ValidationError::InvalidLongitude { .. })
        ));
    }

    #[test]
    fn one_degree_of_latitude_is_sixty_nautical_miles() {
        let a = GeoPoint::new(10.0, 20.0).expect("valid");
        let b = GeoPoint::new(11.0, 20.0).expect("valid");
        let distance = a.distance_nm(b);
        assert!((distance - 60.0).abs() < 0.1, "distance was {distance}");
    }

    #[test]
    fn area_contains_points_within_radius_only() {
        let center = GeoPoint::new(40.6413, -73.7781).expect("valid");
        let area = AreaFilter::new(center, 10.0).expect("valid radius");

        assert!(area.contains(40.70, -73.80));
        assert!(!area.contains(41.50, -73.80));
    }

    #[test]
    fn rejects_non_positive_radius() {
        let center = GeoPoint::new(0.0, 0.0).expect("valid");
        assert!(AreaFilter::new(center, 0.0).is_err());
        assert!(AreaFilter::new(center, f64::NAN).is_err());
    }

    #[test]
    fn identity_target_normalizes_key() {
        let target = QueryTarget::identity("KJFK").expect("valid");
        assert_eq!(target.identity_key(), Some("kjfk"));
        assert_eq!(target.to_string(), "identity:kjfk");
    }
}
