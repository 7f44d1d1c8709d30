//! Planar approximations used for matching.
//!
//! Distances, bearings and offsets are haversine via `geo`. Projections
//! onto a polyline piece use a local equirectangular frame centred on the
//! report, which is accurate to well under a meter over the few hundred meters
//! a stop path piece spans.

use geo::{Coord, HaversineBearing, HaversineDestination, HaversineDistance, Point};

pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Result of projecting a point onto the segment `a -> b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentProjection {
    /// Position of the foot of the perpendicular, 0.0 at `a`, 1.0 at `b`.
    pub fraction: f64,
    pub perpendicular_m: f64,
    pub bearing_deg: f64,
}

pub fn distance_m(a: Coord<f64>, b: Coord<f64>) -> f64 {
    Point::from(a).haversine_distance(&Point::from(b))
}

pub fn project(p: Coord<f64>, a: Coord<f64>, b: Coord<f64>) -> SegmentProjection {
    let cos_lat = p.y.to_radians().cos();
    let to_local = |c: Coord<f64>| {
        (
            (c.x - p.x) * cos_lat * METERS_PER_DEGREE,
            (c.y - p.y) * METERS_PER_DEGREE,
        )
    };

    let (ax, ay) = to_local(a);
    let (bx, by) = to_local(b);
    let (dx, dy) = (bx - ax, by - ay);
    let len2 = dx * dx + dy * dy;

    let fraction = if len2 == 0.0 {
        0.0
    } else {
        ((-ax * dx - ay * dy) / len2).clamp(0.0, 1.0)
    };

    let (fx, fy) = (ax + fraction * dx, ay + fraction * dy);

    SegmentProjection {
        fraction,
        perpendicular_m: (fx * fx + fy * fy).sqrt(),
        bearing_deg: bearing_deg(a, b),
    }
}

/// Initial bearing from `a` to `b` in degrees clockwise from north, `[0, 360)`.
pub fn bearing_deg(a: Coord<f64>, b: Coord<f64>) -> f64 {
    if a == b {
        return 0.0;
    }
    Point::from(a)
        .haversine_bearing(Point::from(b))
        .rem_euclid(360.0)
}

/// Smallest angle between two headings, `[0, 180]`.
pub fn heading_difference_deg(h1: f64, h2: f64) -> f64 {
    let diff = (h1 - h2).rem_euclid(360.0);
    if diff > 180.0 { 360.0 - diff } else { diff }
}

/// Moves `c` by the given number of meters north and east, along the great
/// circle in that direction.
pub fn offset_m(c: Coord<f64>, north_m: f64, east_m: f64) -> Coord<f64> {
    let distance = north_m.hypot(east_m);
    if distance == 0.0 {
        return c;
    }
    let bearing = east_m.atan2(north_m).to_degrees();
    Point::from(c).haversine_destination(bearing, distance).into()
}
