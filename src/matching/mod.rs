//! Spatial matching of a report against the schedule graph.
//!
//! Candidates come first from the vehicle's assigned trip (and the next trip
//! of its block when it is finishing the current one). When that yields
//! nothing usable, every trip active at the report's time whose geometry
//! lies near the report is considered. The closest path piece wins; near
//! ties are broken by forward progress from the previous match, then by the
//! current assignment, then by the scheduled start closest to the report.

pub mod confidence;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

use crate::assignment::Assignment;
use crate::avl::AvlReport;
use crate::config::MatchConfig;
use crate::schedule::geometry::heading_difference_deg;
use crate::schedule::{PathProjection, ScheduleGraph, Trip, TripPattern};

/// A report placed on a specific trip and stop path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub vehicle_id: String,
    pub trip_id: String,
    pub block_id: String,
    pub route_id: String,
    pub service_date: NaiveDate,
    pub stop_path_index: usize,
    /// Stop at the end of the matched path.
    pub stop_id: String,
    pub stop_sequence: u32,
    /// Meters travelled along the matched stop path.
    pub distance_along_segment: f64,
    /// Meters left to the stop at the end of the path.
    pub remaining_m: f64,
    pub perpendicular_m: f64,
    pub confidence: f64,
    pub matched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    /// No active trip's geometry lies within the deviation threshold.
    OffRoute,
    /// Geometry is nearby but no trip using it is running now.
    NoActiveTrip,
    /// Candidates exist but none is trustworthy enough.
    LowConfidence,
}

impl fmt::Display for UnmatchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnmatchedReason::OffRoute => "off route",
            UnmatchedReason::NoActiveTrip => "no active trip",
            UnmatchedReason::LowConfidence => "low confidence",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(Match),
    /// Equally good matches on different blocks that no tie-break rule
    /// separates. The first entry is the one that would be picked.
    Ambiguous(Vec<Match>),
    Unmatched(UnmatchedReason),
}

impl MatchOutcome {
    /// The match to act on, if any.
    pub fn best(&self) -> Option<&Match> {
        match self {
            MatchOutcome::Matched(m) => Some(m),
            MatchOutcome::Ambiguous(ms) => ms.first(),
            MatchOutcome::Unmatched(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TripOnDate<'g> {
    trip: &'g Trip,
    pattern: &'g TripPattern,
    service_date: NaiveDate,
}

#[derive(Debug, Clone)]
struct Candidate<'g> {
    on: TripOnDate<'g>,
    stop_path_index: usize,
    projection: PathProjection,
    confidence: f64,
    forward: bool,
    assigned: bool,
    start_gap_secs: i64,
}

impl Candidate<'_> {
    /// Ordering among near-tied candidates; smaller is better.
    fn tie_key(&self) -> (bool, bool, i64) {
        (!self.forward, !self.assigned, self.start_gap_secs)
    }

    fn cmp_preference(&self, other: &Self) -> Ordering {
        self.tie_key()
            .cmp(&other.tie_key())
            .then(self.projection.perpendicular_m.total_cmp(&other.projection.perpendicular_m))
            .then(self.stop_path_index.cmp(&other.stop_path_index))
    }
}

/// Projects reports onto candidate stop paths. Holds no per-vehicle state;
/// everything it needs about the vehicle is passed in.
#[derive(Debug, Clone)]
pub struct SpatialMatcher {
    config: MatchConfig,
}

impl SpatialMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn match_report(
        &self,
        graph: &ScheduleGraph,
        report: &AvlReport,
        assignment: Option<&Assignment>,
        previous: Option<&Match>,
    ) -> MatchOutcome {
        let assigned_trip = assignment.and_then(|a| a.current_trip());
        let previous = previous.filter(|m| m.matched_at < report.timestamp);

        let mut candidates = Vec::new();
        let mut seen = HashSet::new();

        if let Some((trip_id, service_date)) = assigned_trip {
            for on in self.assigned_trips(graph, trip_id, service_date, previous, assignment) {
                for idx in 0..on.pattern.stop_paths.len() {
                    if seen.insert((on.trip.id.as_str(), on.service_date, idx)) {
                        candidates.extend(self.evaluate(graph, report, on, idx, assigned_trip, previous));
                    }
                }
            }
        }

        let mut nearby_geometry = !candidates.is_empty();
        let local_ok = candidates
            .iter()
            .any(|c| c.confidence >= self.config.min_match_confidence);

        if !local_ok {
            let near = graph.paths_near(report.location(), self.config.max_distance_from_segment_m);
            nearby_geometry |= !near.is_empty();
            for (pattern_id, idx) in near {
                let Some(pattern) = graph.pattern(pattern_id) else {
                    continue;
                };
                for trip in graph.trips_for_pattern(pattern_id) {
                    let Some(active) = graph.trip_activity(
                        trip,
                        report.timestamp,
                        self.config.allowable_early_secs,
                        self.config.allowable_late_secs,
                    ) else {
                        continue;
                    };
                    if !seen.insert((trip.id.as_str(), active.service_date, idx)) {
                        continue;
                    }
                    let on = TripOnDate {
                        trip,
                        pattern,
                        service_date: active.service_date,
                    };
                    candidates.extend(self.evaluate(graph, report, on, idx, assigned_trip, previous));
                }
            }
        }

        if candidates.is_empty() {
            let reason = if nearby_geometry {
                UnmatchedReason::NoActiveTrip
            } else {
                UnmatchedReason::OffRoute
            };
            debug!(vehicle_id = %report.vehicle_id, %reason, "Report not matched");
            return MatchOutcome::Unmatched(reason);
        }

        candidates.retain(|c| c.confidence >= self.config.min_match_confidence);
        if candidates.is_empty() {
            debug!(vehicle_id = %report.vehicle_id, "All candidates below confidence floor");
            return MatchOutcome::Unmatched(UnmatchedReason::LowConfidence);
        }

        self.choose(report, candidates)
    }

    /// The assigned trip, plus the next trip of the block when the vehicle
    /// is on the last path of the current one.
    fn assigned_trips<'g>(
        &self,
        graph: &'g ScheduleGraph,
        trip_id: &str,
        service_date: NaiveDate,
        previous: Option<&Match>,
        assignment: Option<&Assignment>,
    ) -> Vec<TripOnDate<'g>> {
        let Some(trip) = graph.trip(trip_id) else {
            return Vec::new();
        };
        let Some(pattern) = graph.pattern_for(trip) else {
            return Vec::new();
        };
        let mut trips = vec![TripOnDate {
            trip,
            pattern,
            service_date,
        }];

        let finishing = previous.is_some_and(|m| {
            m.trip_id == trip.id && m.stop_path_index + 1 >= pattern.stop_paths.len()
        });
        let in_layover = assignment.is_some_and(|a| a.is_layover());
        if finishing && !in_layover {
            if let Some(next) = graph.next_trip_in_block(&trip.id, service_date) {
                if let Some(next_pattern) = graph.pattern_for(next) {
                    trips.push(TripOnDate {
                        trip: next,
                        pattern: next_pattern,
                        service_date,
                    });
                }
            }
        }
        trips
    }

    fn evaluate<'g>(
        &self,
        graph: &ScheduleGraph,
        report: &AvlReport,
        on: TripOnDate<'g>,
        stop_path_index: usize,
        assigned_trip: Option<(&str, NaiveDate)>,
        previous: Option<&Match>,
    ) -> Option<Candidate<'g>> {
        let path = on.pattern.stop_paths.get(stop_path_index)?;
        let projection = path.project(report.location());
        if projection.perpendicular_m > self.config.max_distance_from_segment_m {
            return None;
        }

        let heading_diff = match report.heading {
            Some(h) if path.points().len() > 1 => {
                let diff = heading_difference_deg(h, projection.bearing_deg);
                if diff > self.config.max_heading_offset_deg {
                    return None;
                }
                Some(diff)
            }
            _ => None,
        };
        let since_previous =
            previous.map(|m| (report.timestamp - m.matched_at).num_milliseconds() as f64 / 1000.0);
        let confidence = confidence::confidence(
            &self.config,
            projection.perpendicular_m,
            heading_diff,
            since_previous,
        );

        let forward = previous.is_some_and(|m| {
            self.is_forward(graph, m, on.trip, stop_path_index, projection.distance_along_m)
        });
        let assigned = assigned_trip
            .is_some_and(|(id, date)| id == on.trip.id && date == on.service_date);
        let start_gap_secs = graph
            .scheduled_instant(on.service_date, on.trip.start_secs())
            .map_or(i64::MAX, |start| (start - report.timestamp).num_seconds().abs());

        Some(Candidate {
            on,
            stop_path_index,
            projection,
            confidence,
            forward,
            assigned,
            start_gap_secs,
        })
    }

    /// Whether a position continues the previous match without going
    /// backwards by more than the tolerance, or moves onto the next trip of
    /// the same block.
    fn is_forward(
        &self,
        graph: &ScheduleGraph,
        previous: &Match,
        trip: &Trip,
        stop_path_index: usize,
        distance_along_m: f64,
    ) -> bool {
        if previous.trip_id == trip.id {
            return match stop_path_index.cmp(&previous.stop_path_index) {
                Ordering::Greater => true,
                Ordering::Equal => {
                    distance_along_m
                        >= previous.distance_along_segment - self.config.backtrack_tolerance_m
                }
                Ordering::Less => false,
            };
        }
        graph
            .next_trip_in_block(&previous.trip_id, previous.service_date)
            .is_some_and(|next| next.id == trip.id)
    }

    fn choose(&self, report: &AvlReport, mut candidates: Vec<Candidate<'_>>) -> MatchOutcome {
        let closest = candidates
            .iter()
            .map(|c| c.projection.perpendicular_m)
            .fold(f64::INFINITY, f64::min);
        candidates.retain(|c| c.projection.perpendicular_m <= closest + self.config.tie_tolerance_m);
        candidates.sort_by(|a, b| a.cmp_preference(b));

        let best_key = candidates[0].tie_key();
        let best_block = candidates[0].on.trip.block_id.clone();
        let contested = candidates
            .iter()
            .skip(1)
            .any(|c| c.tie_key() == best_key && c.on.trip.block_id != best_block);

        if contested {
            let tied: Vec<Match> = candidates
                .iter()
                .filter(|c| c.tie_key() == best_key)
                .map(|c| to_match(report, c))
                .collect();
            debug!(
                vehicle_id = %report.vehicle_id,
                candidates = tied.len(),
                "Ambiguous match across blocks"
            );
            return MatchOutcome::Ambiguous(tied);
        }

        let m = to_match(report, &candidates[0]);
        debug!(
            vehicle_id = %report.vehicle_id,
            trip_id = %m.trip_id,
            stop_path_index = m.stop_path_index,
            distance_along = m.distance_along_segment,
            confidence = m.confidence,
            "Report matched"
        );
        MatchOutcome::Matched(m)
    }
}

fn to_match(report: &AvlReport, c: &Candidate<'_>) -> Match {
    let path = &c.on.pattern.stop_paths[c.stop_path_index];
    Match {
        vehicle_id: report.vehicle_id.clone(),
        trip_id: c.on.trip.id.clone(),
        block_id: c.on.trip.block_id.clone(),
        route_id: c.on.trip.route_id.clone(),
        service_date: c.on.service_date,
        stop_path_index: c.stop_path_index,
        stop_id: path.stop_id.clone(),
        stop_sequence: path.stop_sequence,
        distance_along_segment: c.projection.distance_along_m,
        remaining_m: (path.length_m() - c.projection.distance_along_m).max(0.0),
        perpendicular_m: c.projection.perpendicular_m,
        confidence: c.confidence,
        matched_at: report.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{Assignment, AssignmentState};
    use crate::schedule::fixtures::{self, KM};

    fn report_at(east_m: f64, north_m: f64, at: DateTime<Utc>) -> AvlReport {
        let c = fixtures::point_along(east_m, north_m);
        AvlReport {
            vehicle_id: "V1".into(),
            timestamp: at,
            latitude: c.y,
            longitude: c.x,
            heading: None,
            speed: None,
            source: "test".into(),
        }
    }

    fn assigned_to(trip_id: &str, block_id: &str) -> Assignment {
        let mut a = Assignment::unassigned("V1", fixtures::at(8, 0, 0));
        a.state = AssignmentState::Assigned;
        a.trip_id = Some(trip_id.into());
        a.block_id = Some(block_id.into());
        a.service_date = Some(fixtures::service_date());
        a
    }

    fn matcher() -> SpatialMatcher {
        SpatialMatcher::new(MatchConfig::default())
    }

    #[test]
    fn test_unassigned_prefers_closest_scheduled_start() {
        let graph = fixtures::graph();
        let report = report_at(20.0, 5.0, fixtures::at(8, 0, 0));

        let outcome = matcher().match_report(&graph, &report, None, None);
        let MatchOutcome::Matched(m) = outcome else {
            panic!("expected a match, got {outcome:?}");
        };
        assert_eq!(m.trip_id, "T1");
        assert_eq!(m.stop_path_index, 1);
        assert_eq!(m.stop_id, "B");
        assert!((m.distance_along_segment - 20.0).abs() < 1.0);
        assert!(m.confidence > 0.9);
    }

    #[test]
    fn test_heading_selects_direction() {
        let graph = fixtures::graph();
        let mut report = report_at(500.0, 5.0, fixtures::at(8, 20, 0));
        report.heading = Some(270.0);

        let outcome = matcher().match_report(&graph, &report, None, None);
        assert_eq!(outcome.best().unwrap().trip_id, "T2");
    }

    #[test]
    fn test_far_report_is_off_route() {
        let graph = fixtures::graph();
        let report = report_at(500.0, 500.0, fixtures::at(8, 2, 0));
        assert_eq!(
            matcher().match_report(&graph, &report, None, None),
            MatchOutcome::Unmatched(UnmatchedReason::OffRoute)
        );
    }

    #[test]
    fn test_on_route_outside_service_has_no_active_trip() {
        let graph = fixtures::graph();
        let report = report_at(500.0, 0.0, fixtures::at(3, 0, 0));
        assert_eq!(
            matcher().match_report(&graph, &report, None, None),
            MatchOutcome::Unmatched(UnmatchedReason::NoActiveTrip)
        );
    }

    #[test]
    fn test_existing_assignment_wins_tie() {
        let graph = fixtures::graph();
        // Between T1's and T3's starts; T3 is closer in time but the vehicle
        // is assigned to T1.
        let report = report_at(1.5 * KM, 0.0, fixtures::at(8, 45, 0));
        let assignment = assigned_to("T1", "B1");

        let outcome = matcher().match_report(&graph, &report, Some(&assignment), None);
        assert_eq!(outcome.best().unwrap().trip_id, "T1");

        let unassigned = matcher().match_report(&graph, &report, None, None);
        assert_eq!(unassigned.best().unwrap().trip_id, "T3");
    }

    #[test]
    fn test_forward_progress_breaks_tie_on_shared_geometry() {
        let graph = fixtures::graph();
        let assignment = assigned_to("T1", "B1");
        let earlier = report_at(1.5 * KM, 0.0, fixtures::at(8, 40, 0));
        let previous = matcher()
            .match_report(&graph, &earlier, Some(&assignment), None)
            .best()
            .cloned()
            .unwrap();
        assert_eq!(previous.trip_id, "T1");

        // T3 runs the same geometry and starts closer to now, but only T1
        // continues the previous match.
        let mut report = report_at(1.6 * KM, 0.0, fixtures::at(8, 45, 30));
        report.heading = Some(90.0);
        let outcome = matcher().match_report(&graph, &report, None, Some(&previous));
        assert_eq!(outcome.best().unwrap().trip_id, "T1");

        let fresh = matcher().match_report(&graph, &report, None, None);
        assert_eq!(fresh.best().unwrap().trip_id, "T3");
    }

    #[test]
    fn test_ambiguous_across_blocks() {
        let graph = fixtures::builder()
            .trip(fixtures::trip("T1", "P_EAST", "B1", 8 * 3600))
            .trip(fixtures::trip("T9", "P_EAST", "B9", 8 * 3600))
            .build()
            .unwrap();
        let report = report_at(300.0, 2.0, fixtures::at(8, 1, 0));

        let outcome = matcher().match_report(&graph, &report, None, None);
        let MatchOutcome::Ambiguous(tied) = outcome else {
            panic!("expected ambiguity, got {outcome:?}");
        };
        assert_eq!(tied.len(), 2);
    }

    #[test]
    fn test_next_block_trip_is_a_candidate_at_trip_end() {
        let graph = fixtures::graph();
        let assignment = assigned_to("T1", "B1");
        let near_end = report_at(3.0 * KM - 30.0, 0.0, fixtures::at(8, 9, 0));
        let previous = matcher()
            .match_report(&graph, &near_end, Some(&assignment), None)
            .best()
            .cloned()
            .unwrap();
        assert_eq!(previous.stop_path_index, 3);

        // Heading back west along T2's first path.
        let mut turned = report_at(2.5 * KM, 0.0, fixtures::at(8, 17, 0));
        turned.heading = Some(270.0);
        let outcome = matcher().match_report(&graph, &turned, Some(&assignment), Some(&previous));
        let best = outcome.best().unwrap();
        assert_eq!(best.trip_id, "T2");
        assert_eq!(best.stop_path_index, 1);
    }
}
