//! Static schedule graph consumed by matching, assignment and prediction.
//!
//! [`ScheduleGraph`] is immutable per version. [`ScheduleHandle`] owns the
//! current version and swaps in a replacement only once it is fully built.

pub mod calendar;
pub mod geometry;
pub mod graph;
pub mod handle;
pub mod index;
pub mod source;

pub use calendar::{DayType, Service, ServiceCalendar};
pub use graph::{
    ActiveTrip, Block, PathProjection, Route, ScheduleGraph, ScheduleGraphBuilder, ScheduleTime,
    Stop, StopPath, Trip, TripPattern,
};
pub use handle::ScheduleHandle;
pub use source::{ScheduleDocument, load_schedule_file};

/// A small straight-line network shared by the unit tests.
///
/// Four stops A-B-C-D sit 1 km apart heading east along latitude 45. Pattern
/// `P_EAST` runs A to D and `P_WEST` runs D to A; both take 3 minutes per
/// segment. Block `B1` runs T1 (east, 08:00) then T2 (west, 08:15); block
/// `B2` runs T3 (east, 09:00). Service `WK` runs on weekdays in 2026.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use geo::Coord;
    use std::collections::HashSet;

    pub const KM: f64 = 1000.0;
    pub const SEGMENT_SECS: i64 = 180;

    pub fn origin() -> Coord<f64> {
        Coord { x: -122.7, y: 45.0 }
    }

    /// A point `east_m` along the line from stop A, `north_m` off it.
    pub fn point_along(east_m: f64, north_m: f64) -> Coord<f64> {
        geometry::offset_m(origin(), north_m, east_m)
    }

    pub fn service_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    /// A UTC instant on the fixture's Monday service date.
    pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    fn stop_locations() -> Vec<(&'static str, Coord<f64>)> {
        vec![
            ("A", point_along(0.0, 0.0)),
            ("B", point_along(KM, 0.0)),
            ("C", point_along(2.0 * KM, 0.0)),
            ("D", point_along(3.0 * KM, 0.0)),
        ]
    }

    fn pattern(id: &str, order: &[usize]) -> TripPattern {
        let stops = stop_locations();
        let mut stop_paths = Vec::new();
        for (i, &s) in order.iter().enumerate() {
            let (stop_id, location) = stops[s];
            let (path_id, points) = if i == 0 {
                (format!("{id}:0"), vec![location])
            } else {
                let (prev_id, prev) = stops[order[i - 1]];
                (format!("{prev_id}-{stop_id}"), vec![prev, location])
            };
            stop_paths.push(StopPath::new(path_id, stop_id, i as u32 + 1, points).unwrap());
        }
        TripPattern {
            id: id.to_string(),
            route_id: "R1".to_string(),
            stop_paths,
        }
    }

    pub fn trip(id: &str, pattern_id: &str, block_id: &str, start_secs: i64) -> Trip {
        Trip {
            id: id.to_string(),
            route_id: "R1".to_string(),
            block_id: block_id.to_string(),
            service_id: "WK".to_string(),
            pattern_id: pattern_id.to_string(),
            direction_id: Some(if pattern_id == "P_EAST" { 0 } else { 1 }),
            headsign: None,
            schedule: (0..4)
                .map(|i| {
                    let t = start_secs + i * SEGMENT_SECS;
                    ScheduleTime {
                        arrival_secs: t,
                        departure_secs: t,
                    }
                })
                .collect(),
        }
    }

    pub fn builder_with_version(version: &str) -> ScheduleGraphBuilder {
        let mut builder = ScheduleGraph::builder(version, chrono_tz::Tz::UTC)
            .route(Route {
                id: "R1".into(),
                short_name: Some("1".into()),
                long_name: None,
            })
            .pattern(pattern("P_EAST", &[0, 1, 2, 3]))
            .pattern(pattern("P_WEST", &[3, 2, 1, 0]))
            .service(Service {
                id: "WK".into(),
                weekdays: [true, true, true, true, true, false, false],
                start_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
                added_dates: HashSet::new(),
                removed_dates: HashSet::new(),
            });
        for (id, location) in stop_locations() {
            builder = builder.stop(Stop {
                id: id.to_string(),
                name: format!("Stop {id}"),
                location,
            });
        }
        builder
    }

    pub fn builder() -> ScheduleGraphBuilder {
        builder_with_version("v1")
    }

    /// Block `B1` with a Saturday-only trip `S1` (08:10) between T1 and T2.
    pub fn mixed_service_graph() -> ScheduleGraph {
        let mut saturday_trip = trip("S1", "P_WEST", "B1", 8 * 3600 + 10 * 60);
        saturday_trip.service_id = "SAT".into();
        builder()
            .service(Service {
                id: "SAT".into(),
                weekdays: [false, false, false, false, false, true, false],
                start_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
                added_dates: HashSet::new(),
                removed_dates: HashSet::new(),
            })
            .trip(trip("T1", "P_EAST", "B1", 8 * 3600))
            .trip(saturday_trip)
            .trip(trip("T2", "P_WEST", "B1", 8 * 3600 + 15 * 60))
            .build()
            .unwrap()
    }

    pub fn graph() -> ScheduleGraph {
        builder()
            .trip(trip("T1", "P_EAST", "B1", 8 * 3600))
            .trip(trip("T2", "P_WEST", "B1", 8 * 3600 + 15 * 60))
            .trip(trip("T3", "P_EAST", "B2", 9 * 3600))
            .build()
            .unwrap()
    }
}
