//! Immutable schedule graph: routes, trip patterns with stop-path geometry,
//! trips, blocks and the service calendar.
//!
//! A graph is built once per schedule version by [`ScheduleGraphBuilder`] and
//! never mutated afterwards; a new version replaces it wholesale through
//! [`super::ScheduleHandle`].

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use geo::Coord;
use std::collections::{HashMap, HashSet};

use super::calendar::{DayType, Service, ServiceCalendar};
use super::geometry::{self, SegmentProjection};
use super::index::SegmentIndex;
use crate::error::ScheduleError;

#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Stop {
    pub id: String,
    pub name: String,
    pub location: Coord<f64>,
}

/// The path a vehicle follows to reach one stop of a pattern. Path `i` ends
/// at the pattern's stop `i`; path 0 is the approach to the first stop and is
/// usually a single point.
#[derive(Debug, Clone)]
pub struct StopPath {
    /// Segment identifier keying travel-time statistics.
    pub id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    points: Vec<Coord<f64>>,
    cumulative_m: Vec<f64>,
}

/// Where a coordinate falls on a stop path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathProjection {
    pub segment_index: usize,
    pub perpendicular_m: f64,
    pub distance_along_m: f64,
    pub bearing_deg: f64,
}

impl StopPath {
    pub fn new(
        id: impl Into<String>,
        stop_id: impl Into<String>,
        stop_sequence: u32,
        points: Vec<Coord<f64>>,
    ) -> Result<Self, ScheduleError> {
        let id = id.into();
        if points.is_empty() {
            return Err(ScheduleError::EmptyGeometry { path_id: id });
        }

        let mut cumulative_m = Vec::with_capacity(points.len());
        let mut total = 0.0;
        cumulative_m.push(0.0);
        for pair in points.windows(2) {
            total += geometry::distance_m(pair[0], pair[1]);
            cumulative_m.push(total);
        }

        Ok(Self {
            id,
            stop_id: stop_id.into(),
            stop_sequence,
            points,
            cumulative_m,
        })
    }

    pub fn points(&self) -> &[Coord<f64>] {
        &self.points
    }

    pub fn length_m(&self) -> f64 {
        self.cumulative_m.last().copied().unwrap_or(0.0)
    }

    pub fn end(&self) -> Coord<f64> {
        self.points[self.points.len() - 1]
    }

    /// Projects `p` onto the closest piece of the polyline.
    pub fn project(&self, p: Coord<f64>) -> PathProjection {
        if self.points.len() == 1 {
            let proj = geometry::project(p, self.points[0], self.points[0]);
            return PathProjection {
                segment_index: 0,
                perpendicular_m: proj.perpendicular_m,
                distance_along_m: 0.0,
                bearing_deg: proj.bearing_deg,
            };
        }

        let mut best: Option<(usize, SegmentProjection)> = None;
        for (i, pair) in self.points.windows(2).enumerate() {
            let proj = geometry::project(p, pair[0], pair[1]);
            if best.is_none_or(|(_, b)| proj.perpendicular_m < b.perpendicular_m) {
                best = Some((i, proj));
            }
        }

        let (segment_index, proj) = best.unwrap_or((
            0,
            SegmentProjection {
                fraction: 0.0,
                perpendicular_m: f64::INFINITY,
                bearing_deg: 0.0,
            },
        ));
        let piece_len = self.cumulative_m[segment_index + 1] - self.cumulative_m[segment_index];

        PathProjection {
            segment_index,
            perpendicular_m: proj.perpendicular_m,
            distance_along_m: self.cumulative_m[segment_index] + proj.fraction * piece_len,
            bearing_deg: proj.bearing_deg,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TripPattern {
    pub id: String,
    pub route_id: String,
    pub stop_paths: Vec<StopPath>,
}

impl TripPattern {
    /// Distance from the start of path `from` (at `from_offset_m` into it) to
    /// the end of path `to`.
    pub fn distance_between(&self, from: usize, from_offset_m: f64, to: usize) -> f64 {
        if to < from {
            return 0.0;
        }
        let mut total = self.stop_paths[from].length_m() - from_offset_m;
        for path in &self.stop_paths[from + 1..=to] {
            total += path.length_m();
        }
        total.max(0.0)
    }
}

/// Scheduled times at one stop, in seconds after the service day start.
/// Values above 86400 denote trips running past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTime {
    pub arrival_secs: i64,
    pub departure_secs: i64,
}

#[derive(Debug, Clone)]
pub struct Trip {
    pub id: String,
    pub route_id: String,
    pub block_id: String,
    pub service_id: String,
    pub pattern_id: String,
    pub direction_id: Option<u32>,
    pub headsign: Option<String>,
    pub schedule: Vec<ScheduleTime>,
}

impl Trip {
    pub fn start_secs(&self) -> i64 {
        self.schedule.first().map_or(0, |t| t.departure_secs)
    }

    pub fn end_secs(&self) -> i64 {
        self.schedule.last().map_or(0, |t| t.arrival_secs)
    }
}

/// Trips served by one vehicle run, ordered by start time.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: String,
    pub trip_ids: Vec<String>,
}

/// A trip running (or about to run) on a given service date.
#[derive(Debug, Clone, Copy)]
pub struct ActiveTrip<'a> {
    pub trip: &'a Trip,
    pub service_date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ScheduleGraph {
    version: String,
    timezone: Tz,
    routes: HashMap<String, Route>,
    stops: HashMap<String, Stop>,
    patterns: HashMap<String, TripPattern>,
    trips: HashMap<String, Trip>,
    blocks: HashMap<String, Block>,
    calendar: ServiceCalendar,
    trips_by_pattern: HashMap<String, Vec<String>>,
    segment_index: SegmentIndex,
    scheduled_segment_secs: HashMap<String, f64>,
}

impl ScheduleGraph {
    pub fn builder(version: impl Into<String>, timezone: Tz) -> ScheduleGraphBuilder {
        ScheduleGraphBuilder {
            version: version.into(),
            timezone,
            routes: HashMap::new(),
            stops: HashMap::new(),
            patterns: HashMap::new(),
            trips: Vec::new(),
            calendar: ServiceCalendar::default(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn route(&self, id: &str) -> Option<&Route> {
        self.routes.get(id)
    }

    pub fn stop(&self, id: &str) -> Option<&Stop> {
        self.stops.get(id)
    }

    pub fn pattern(&self, id: &str) -> Option<&TripPattern> {
        self.patterns.get(id)
    }

    pub fn trip(&self, id: &str) -> Option<&Trip> {
        self.trips.get(id)
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn trips(&self) -> impl Iterator<Item = &Trip> {
        self.trips.values()
    }

    pub fn pattern_for(&self, trip: &Trip) -> Option<&TripPattern> {
        self.patterns.get(&trip.pattern_id)
    }

    pub fn trips_for_pattern(&self, pattern_id: &str) -> impl Iterator<Item = &Trip> {
        self.trips_by_pattern
            .get(pattern_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.trips.get(id))
    }

    /// The trip following `trip_id` in its block among those running on
    /// `service_date`. A block may mix services; trips of services not
    /// active that day are skipped.
    pub fn next_trip_in_block(&self, trip_id: &str, service_date: NaiveDate) -> Option<&Trip> {
        let trip = self.trips.get(trip_id)?;
        let block = self.blocks.get(&trip.block_id)?;
        let pos = block.trip_ids.iter().position(|id| id == trip_id)?;
        block.trip_ids[pos + 1..]
            .iter()
            .filter_map(|id| self.trips.get(id))
            .find(|t| self.calendar.is_active(&t.service_id, service_date))
    }

    /// Scheduled duration per segment id, averaged over the trips using it.
    pub fn scheduled_segment_secs(&self) -> &HashMap<String, f64> {
        &self.scheduled_segment_secs
    }

    pub fn day_type(&self, service_date: NaiveDate) -> DayType {
        self.calendar.day_type(service_date)
    }

    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.timezone).date_naive()
    }

    /// Seconds since local midnight for `at`.
    pub fn seconds_into_day(&self, at: DateTime<Utc>) -> u32 {
        at.with_timezone(&self.timezone).num_seconds_from_midnight()
    }

    /// Start of the service day: local noon minus twelve hours, which stays
    /// well-defined across daylight-saving transitions.
    pub fn service_day_start(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        let noon = date.and_hms_opt(12, 0, 0)?;
        let local = noon.and_local_timezone(self.timezone).earliest()?;
        Some(local.with_timezone(&Utc) - Duration::hours(12))
    }

    pub fn scheduled_instant(&self, service_date: NaiveDate, secs: i64) -> Option<DateTime<Utc>> {
        Some(self.service_day_start(service_date)? + Duration::seconds(secs))
    }

    /// Whether `trip` runs on a service date such that `at` falls within its
    /// scheduled span widened by `early_secs`/`late_secs`.
    pub fn trip_activity<'a>(
        &self,
        trip: &'a Trip,
        at: DateTime<Utc>,
        early_secs: i64,
        late_secs: i64,
    ) -> Option<ActiveTrip<'a>> {
        let today = self.local_date(at);
        let dates = [today.pred_opt(), Some(today), today.succ_opt()];

        dates
            .into_iter()
            .flatten()
            .filter(|d| self.calendar.is_active(&trip.service_id, *d))
            .filter_map(|d| {
                let start = self.scheduled_instant(d, trip.start_secs())?;
                let end = self.scheduled_instant(d, trip.end_secs())?;
                let window_open = start - Duration::seconds(early_secs);
                let window_close = end + Duration::seconds(late_secs);
                (at >= window_open && at <= window_close).then_some(ActiveTrip {
                    trip,
                    service_date: d,
                    start,
                    end,
                })
            })
            .min_by_key(|a| (a.start - at).num_seconds().abs())
    }

    /// Stop paths with a polyline piece within `radius_m` of `c`, as
    /// `(pattern_id, stop_path_index)` pairs.
    pub fn paths_near(&self, c: Coord<f64>, radius_m: f64) -> Vec<(&str, usize)> {
        self.segment_index.paths_near(c, radius_m)
    }
}

pub struct ScheduleGraphBuilder {
    version: String,
    timezone: Tz,
    routes: HashMap<String, Route>,
    stops: HashMap<String, Stop>,
    patterns: HashMap<String, TripPattern>,
    trips: Vec<Trip>,
    calendar: ServiceCalendar,
}

impl ScheduleGraphBuilder {
    pub fn route(mut self, route: Route) -> Self {
        self.routes.insert(route.id.clone(), route);
        self
    }

    pub fn stop(mut self, stop: Stop) -> Self {
        self.stops.insert(stop.id.clone(), stop);
        self
    }

    pub fn pattern(mut self, pattern: TripPattern) -> Self {
        self.patterns.insert(pattern.id.clone(), pattern);
        self
    }

    pub fn trip(mut self, trip: Trip) -> Self {
        self.trips.push(trip);
        self
    }

    pub fn service(mut self, service: Service) -> Self {
        self.calendar.add_service(service);
        self
    }

    pub fn holiday(mut self, date: NaiveDate) -> Self {
        self.calendar.add_holiday(date);
        self
    }

    pub fn build(self) -> Result<ScheduleGraph, ScheduleError> {
        for pattern in self.patterns.values() {
            require(&self.routes, &pattern.route_id, "route", &pattern.id)?;
            for path in &pattern.stop_paths {
                require(&self.stops, &path.stop_id, "stop", &pattern.id)?;
            }
        }

        let mut segment_samples: HashMap<String, (f64, u32)> = HashMap::new();
        let mut trips_by_pattern: HashMap<String, Vec<String>> = HashMap::new();

        for trip in &self.trips {
            require(&self.routes, &trip.route_id, "route", &trip.id)?;
            let pattern = require(&self.patterns, &trip.pattern_id, "pattern", &trip.id)?;
            if !self.calendar.contains(&trip.service_id) {
                return Err(ScheduleError::UnknownReference {
                    kind: "service",
                    id: trip.service_id.clone(),
                    referenced_by: trip.id.clone(),
                });
            }
            validate_schedule(trip, pattern)?;

            for (i, path) in pattern.stop_paths.iter().enumerate().skip(1) {
                let secs = (trip.schedule[i].arrival_secs - trip.schedule[i - 1].departure_secs) as f64;
                let entry = segment_samples.entry(path.id.clone()).or_insert((0.0, 0));
                entry.0 += secs;
                entry.1 += 1;
            }

            trips_by_pattern
                .entry(trip.pattern_id.clone())
                .or_default()
                .push(trip.id.clone());
        }

        let blocks = build_blocks(&self.trips)?;

        let scheduled_segment_secs = segment_samples
            .into_iter()
            .map(|(id, (sum, n))| (id, sum / n as f64))
            .collect();

        let segment_index = SegmentIndex::build(&self.patterns);

        Ok(ScheduleGraph {
            version: self.version,
            timezone: self.timezone,
            routes: self.routes,
            stops: self.stops,
            patterns: self.patterns,
            trips: self.trips.into_iter().map(|t| (t.id.clone(), t)).collect(),
            blocks,
            calendar: self.calendar,
            trips_by_pattern,
            segment_index,
            scheduled_segment_secs,
        })
    }
}

fn require<'a, T>(
    map: &'a HashMap<String, T>,
    id: &str,
    kind: &'static str,
    referenced_by: &str,
) -> Result<&'a T, ScheduleError> {
    map.get(id).ok_or_else(|| ScheduleError::UnknownReference {
        kind,
        id: id.to_string(),
        referenced_by: referenced_by.to_string(),
    })
}

fn validate_schedule(trip: &Trip, pattern: &TripPattern) -> Result<(), ScheduleError> {
    if trip.schedule.len() != pattern.stop_paths.len() || trip.schedule.is_empty() {
        return Err(ScheduleError::ScheduleLength {
            trip_id: trip.id.clone(),
            times: trip.schedule.len(),
            stops: pattern.stop_paths.len(),
        });
    }

    let mut previous_departure = i64::MIN;
    for (index, time) in trip.schedule.iter().enumerate() {
        if time.arrival_secs < previous_departure || time.departure_secs < time.arrival_secs {
            return Err(ScheduleError::DecreasingTimes {
                trip_id: trip.id.clone(),
                index,
            });
        }
        previous_departure = time.departure_secs;
    }
    Ok(())
}

/// Groups trips into blocks ordered by start time, rejecting overlaps between
/// trips that run on the same service.
fn build_blocks(trips: &[Trip]) -> Result<HashMap<String, Block>, ScheduleError> {
    let mut grouped: HashMap<&str, Vec<&Trip>> = HashMap::new();
    for trip in trips {
        grouped.entry(trip.block_id.as_str()).or_default().push(trip);
    }

    let mut blocks = HashMap::with_capacity(grouped.len());
    for (block_id, mut block_trips) in grouped {
        block_trips.sort_by_key(|t| (t.start_secs(), t.end_secs()));

        let mut last_by_service: HashMap<&str, &Trip> = HashMap::new();
        for trip in &block_trips {
            if let Some(previous) = last_by_service.get(trip.service_id.as_str()) {
                if trip.start_secs() < previous.end_secs() {
                    return Err(ScheduleError::OverlappingTrips {
                        block_id: block_id.to_string(),
                        trip_id: trip.id.clone(),
                        previous_trip_id: previous.id.clone(),
                    });
                }
            }
            last_by_service.insert(trip.service_id.as_str(), trip);
        }

        let mut seen = HashSet::new();
        let trip_ids = block_trips
            .into_iter()
            .filter(|t| seen.insert(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect();

        blocks.insert(
            block_id.to_string(),
            Block {
                id: block_id.to_string(),
                trip_ids,
            },
        );
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::fixtures::{self, KM};
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    #[test]
    fn test_stop_path_length_and_projection() {
        let a = fixtures::point_along(0.0, 0.0);
        let b = fixtures::point_along(KM, 0.0);
        let c = fixtures::point_along(KM, 500.0);
        let path = StopPath::new("p", "S", 1, vec![a, b, c]).unwrap();

        assert_relative_eq!(path.length_m(), 1500.0, epsilon = 1.0);

        let proj = path.project(geometry::offset_m(b, 250.0, 10.0));
        assert_eq!(proj.segment_index, 1);
        assert_relative_eq!(proj.distance_along_m, 1250.0, epsilon = 1.0);
        assert_relative_eq!(proj.perpendicular_m, 10.0, epsilon = 0.2);
    }

    #[test]
    fn test_stop_path_requires_geometry() {
        assert!(matches!(
            StopPath::new("p", "S", 1, vec![]),
            Err(ScheduleError::EmptyGeometry { .. })
        ));
    }

    #[test]
    fn test_blocks_are_time_ordered() {
        let graph = fixtures::graph();
        let block = graph.block("B1").unwrap();
        assert_eq!(block.trip_ids, vec!["T1".to_string(), "T2".to_string()]);
        let monday = fixtures::service_date();
        assert_eq!(graph.next_trip_in_block("T1", monday).unwrap().id, "T2");
        assert!(graph.next_trip_in_block("T2", monday).is_none());
    }

    #[test]
    fn test_next_block_trip_skips_services_not_running() {
        let graph = fixtures::mixed_service_graph();

        assert_eq!(graph.block("B1").unwrap().trip_ids, vec!["T1", "S1", "T2"]);
        let monday = fixtures::service_date();
        assert_eq!(graph.next_trip_in_block("T1", monday).unwrap().id, "T2");
        let saturday = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        assert_eq!(graph.next_trip_in_block("T1", saturday).unwrap().id, "S1");
        assert!(graph.next_trip_in_block("S1", saturday).is_none());
    }

    #[test]
    fn test_overlapping_block_trips_rejected() {
        let result = fixtures::builder()
            .trip(fixtures::trip("T1", "P_EAST", "B1", 8 * 3600))
            .trip(fixtures::trip("T2", "P_WEST", "B1", 8 * 3600 + 300))
            .build();

        assert!(matches!(result, Err(ScheduleError::OverlappingTrips { .. })));
    }

    #[test]
    fn test_unknown_pattern_rejected() {
        let result = fixtures::builder()
            .trip(fixtures::trip("T9", "NOPE", "B9", 8 * 3600))
            .build();
        assert!(matches!(
            result,
            Err(ScheduleError::UnknownReference { kind: "pattern", .. })
        ));
    }

    #[test]
    fn test_scheduled_segment_secs_from_stop_times() {
        let graph = fixtures::graph();
        assert_eq!(graph.scheduled_segment_secs().get("A-B"), Some(&180.0));
        assert_eq!(graph.scheduled_segment_secs().get("D-C"), Some(&180.0));
    }

    #[test]
    fn test_trip_activity_window() {
        let graph = fixtures::graph();
        let t1 = graph.trip("T1").unwrap();

        let active = graph.trip_activity(t1, fixtures::at(8, 5, 0), 900, 5400).unwrap();
        assert_eq!(active.service_date, fixtures::service_date());
        assert_eq!(active.start, fixtures::at(8, 0, 0));
        assert_eq!(active.end, fixtures::at(8, 9, 0));

        assert!(graph.trip_activity(t1, fixtures::at(7, 30, 0), 900, 5400).is_none());
        assert!(graph.trip_activity(t1, fixtures::at(7, 46, 0), 900, 5400).is_some());

        let saturday = Utc.with_ymd_and_hms(2026, 3, 7, 8, 5, 0).unwrap();
        assert!(graph.trip_activity(t1, saturday, 900, 5400).is_none());
    }

    #[test]
    fn test_paths_near_uses_index() {
        let graph = fixtures::graph();
        let near = graph.paths_near(fixtures::point_along(0.5 * KM, 10.0), 60.0);
        assert!(near.contains(&("P_EAST", 1)));
        assert!(near.contains(&("P_WEST", 3)));
        assert!(!near.iter().any(|(_, idx)| *idx == 2));

        assert!(graph.paths_near(fixtures::point_along(0.5 * KM, 500.0), 60.0).is_empty());
    }

    #[test]
    fn test_distance_between_paths() {
        let graph = fixtures::graph();
        let pattern = graph.pattern("P_EAST").unwrap();
        assert_relative_eq!(pattern.distance_between(1, 400.0, 1), 600.0, epsilon = 1.0);
        assert_relative_eq!(pattern.distance_between(1, 400.0, 3), 2600.0, epsilon = 2.0);
        assert_eq!(pattern.distance_between(2, 0.0, 1), 0.0);
    }
}
