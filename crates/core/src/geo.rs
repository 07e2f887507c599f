//! Flat-earth and great-circle helpers for short-range mission planning.

use serde::{Deserialize, Serialize};

use crate::types::Coordinate;

/// Mean Earth radius used for great-circle distances
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude used for local offsets
pub const METERS_PER_DEGREE_LAT: f64 = 111_000.0;

/// Great-circle distance between two lat/lon pairs in meters
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// East/north displacement in meters from a reference point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalOffset {
    /// Meters east of the reference
    pub east_m: f64,
    /// Meters north of the reference
    pub north_m: f64,
}

impl LocalOffset {
    /// Create an offset
    pub fn new(east_m: f64, north_m: f64) -> Self {
        Self { east_m, north_m }
    }

    /// Apply this offset to `origin`, producing a coordinate at `alt`.
    ///
    /// Uses an equirectangular approximation, accurate to well under a meter
    /// over survey-sized areas away from the poles.
    pub fn apply(&self, origin: &Coordinate, alt: f64) -> Coordinate {
        let lat = origin.lat + self.north_m / METERS_PER_DEGREE_LAT;
        let cos_lat = origin.lat.to_radians().cos();
        let lon = if cos_lat.abs() > f64::EPSILON {
            origin.lon + self.east_m / (METERS_PER_DEGREE_LAT * cos_lat)
        } else {
            origin.lon
        };
        Coordinate::new(lat, lon, alt)
    }
}

/// Operating boundary a vehicle must stay inside
#[derive(Debug, Clone, PartialEq)]
pub enum Geofence {
    /// Circle around a fixed point
    Circle {
        /// Center of the allowed area
        center: Coordinate,
        /// Allowed radius in meters
        radius_m: f64,
    },
    /// Closed polygon of (lat, lon) vertices
    Polygon(Vec<(f64, f64)>),
}

impl Geofence {
    /// True when the horizontal position lies inside the boundary
    pub fn contains(&self, position: &Coordinate) -> bool {
        match self {
            Geofence::Circle { center, radius_m } => {
                center.horizontal_distance_m(position) <= *radius_m
            }
            Geofence::Polygon(vertices) => point_in_polygon(position.lat, position.lon, vertices),
        }
    }
}

/// Ray-casting point-in-polygon test over (lat, lon) vertices.
///
/// Polygons with fewer than three vertices contain nothing.
pub fn point_in_polygon(lat: f64, lon: f64, vertices: &[(f64, f64)]) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (lat_i, lon_i) = vertices[i];
        let (lat_j, lon_j) = vertices[j];
        if (lat_i > lat) != (lat_j > lat) {
            let crossing = (lon_j - lon_i) * (lat - lat_i) / (lat_j - lat_i) + lon_i;
            if lon < crossing {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 50.0, "got {d}");
    }

    #[test]
    fn test_offset_round_trip_distance() {
        let origin = Coordinate::new(45.0, -122.0, 0.0);
        let moved = LocalOffset::new(0.0, 100.0).apply(&origin, 0.0);
        let d = origin.horizontal_distance_m(&moved);
        // 111_000 m/deg approximation vs. spherical haversine
        assert!((d - 100.0).abs() < 0.5, "got {d}");
    }

    #[test]
    fn test_polygon_contains() {
        let square = vec![(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)];
        let fence = Geofence::Polygon(square);
        assert!(fence.contains(&Coordinate::new(0.5, 0.5, 0.0)));
        assert!(!fence.contains(&Coordinate::new(1.5, 0.5, 0.0)));
        assert!(!fence.contains(&Coordinate::new(0.5, -0.1, 0.0)));
    }

    #[test]
    fn test_degenerate_polygon_contains_nothing() {
        assert!(!point_in_polygon(0.0, 0.0, &[(0.0, 0.0), (1.0, 1.0)]));
    }

    #[test]
    fn test_circle_contains() {
        let center = Coordinate::new(45.0, -122.0, 0.0);
        let fence = Geofence::Circle {
            center,
            radius_m: 500.0,
        };
        assert!(fence.contains(&LocalOffset::new(300.0, 300.0).apply(&center, 50.0)));
        assert!(!fence.contains(&LocalOffset::new(400.0, 400.0).apply(&center, 50.0)));
    }

    proptest! {
        #[test]
        fn circle_fence_agrees_with_distance(east in -1000.0f64..1000.0, north in -1000.0f64..1000.0) {
            let center = Coordinate::new(10.0, 20.0, 0.0);
            let fence = Geofence::Circle { center, radius_m: 600.0 };
            let p = LocalOffset::new(east, north).apply(&center, 0.0);
            prop_assert_eq!(fence.contains(&p), center.horizontal_distance_m(&p) <= 600.0);
        }
    }
}
