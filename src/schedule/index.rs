//! R-tree over every polyline piece of every stop path.
//!
//! Envelopes are in degrees. A query widens the report's point by the search
//! radius converted to degrees at that latitude, so the tree only acts as a
//! coarse filter; exact perpendicular distances are computed by the matcher.

use geo::Coord;
use rstar::{AABB, RTree, RTreeObject};
use std::collections::{BTreeSet, HashMap};

use super::geometry::EARTH_RADIUS_M;
use super::graph::TripPattern;

const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

#[derive(Debug, Clone)]
struct PathPieceNode {
    pattern: usize,
    stop_path_index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for PathPieceNode {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

#[derive(Debug)]
pub struct SegmentIndex {
    tree: RTree<PathPieceNode>,
    pattern_ids: Vec<String>,
}

impl SegmentIndex {
    pub fn build(patterns: &HashMap<String, TripPattern>) -> Self {
        let mut pattern_ids = Vec::with_capacity(patterns.len());
        let mut nodes = Vec::new();

        for (pattern, tp) in patterns.values().enumerate() {
            pattern_ids.push(tp.id.clone());
            for (stop_path_index, path) in tp.stop_paths.iter().enumerate() {
                let points = path.points();
                if points.len() == 1 {
                    nodes.push(PathPieceNode {
                        pattern,
                        stop_path_index,
                        envelope: AABB::from_point([points[0].x, points[0].y]),
                    });
                    continue;
                }
                for pair in points.windows(2) {
                    nodes.push(PathPieceNode {
                        pattern,
                        stop_path_index,
                        envelope: AABB::from_corners(
                            [pair[0].x, pair[0].y],
                            [pair[1].x, pair[1].y],
                        ),
                    });
                }
            }
        }

        Self {
            tree: RTree::bulk_load(nodes),
            pattern_ids,
        }
    }

    pub fn paths_near(&self, c: Coord<f64>, radius_m: f64) -> Vec<(&str, usize)> {
        let dlat = radius_m / METERS_PER_DEGREE;
        let dlon = radius_m / (METERS_PER_DEGREE * c.y.to_radians().cos().max(1e-6));
        let query = AABB::from_corners([c.x - dlon, c.y - dlat], [c.x + dlon, c.y + dlat]);

        let found: BTreeSet<(usize, usize)> = self
            .tree
            .locate_in_envelope_intersecting(&query)
            .map(|n| (n.pattern, n.stop_path_index))
            .collect();

        found
            .into_iter()
            .map(|(p, i)| (self.pattern_ids[p].as_str(), i))
            .collect()
    }
}
