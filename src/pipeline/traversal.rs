//! Turns consecutive matches on a trip into completed stop-path traversals
//! and arrival/departure events at the stops passed.
//!
//! A path counts as traversed only when the vehicle was seen entering it and
//! then leaving it. When several reports skip over stop boundaries, the
//! crossing times are interpolated by distance between the two positions.
//! The approach path 0 is never recorded. Passing a stop yields an arrival
//! and a departure at the crossing time; the first stop only departs and the
//! terminal only arrives.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::matching::Match;
use crate::schedule::{ScheduleGraph, Trip, TripPattern};
use crate::store::Traversal;

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTraversal {
    pub segment_id: String,
    pub entered_at: DateTime<Utc>,
    pub seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopEventKind {
    Arrival,
    Departure,
}

/// A vehicle observed arriving at or departing from a stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalDeparture {
    pub vehicle_id: String,
    pub trip_id: String,
    pub route_id: String,
    pub block_id: String,
    pub service_date: NaiveDate,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub stop_path_index: usize,
    pub kind: StopEventKind,
    /// Interpolated crossing time.
    pub time: DateTime<Utc>,
    pub scheduled: Option<DateTime<Utc>>,
    /// Timestamp of the report that revealed the event.
    pub avl_time: DateTime<Utc>,
}

impl ArrivalDeparture {
    /// Observed minus scheduled time; positive is late.
    pub fn schedule_deviation_secs(&self) -> Option<i64> {
        self.scheduled.map(|s| (self.time - s).num_seconds())
    }
}

/// What one match added on top of the previous traversal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub completed: Vec<CompletedTraversal>,
    pub events: Vec<ArrivalDeparture>,
}

struct EventSource<'a> {
    graph: &'a ScheduleGraph,
    trip: &'a Trip,
    pattern: &'a TripPattern,
    m: &'a Match,
}

impl EventSource<'_> {
    fn event(&self, index: usize, kind: StopEventKind, time: DateTime<Utc>) -> ArrivalDeparture {
        let path = &self.pattern.stop_paths[index];
        let scheduled = self.trip.schedule.get(index).and_then(|t| {
            let secs = match kind {
                StopEventKind::Arrival => t.arrival_secs,
                StopEventKind::Departure => t.departure_secs,
            };
            self.graph.scheduled_instant(self.m.service_date, secs)
        });
        ArrivalDeparture {
            vehicle_id: self.m.vehicle_id.clone(),
            trip_id: self.trip.id.clone(),
            route_id: self.trip.route_id.clone(),
            block_id: self.trip.block_id.clone(),
            service_date: self.m.service_date,
            stop_id: path.stop_id.clone(),
            stop_sequence: path.stop_sequence,
            stop_path_index: index,
            kind,
            time,
            scheduled,
            avl_time: self.m.matched_at,
        }
    }
}

/// Advances the traversal for a new match. `trip_end_tolerance_m` decides
/// when the last path of a trip counts as finished, since the vehicle never
/// moves past it on the same trip.
pub fn advance(
    graph: &ScheduleGraph,
    previous: Option<&Traversal>,
    m: &Match,
    trip_end_tolerance_m: f64,
) -> (Traversal, Progress) {
    let mut next = Traversal {
        trip_id: m.trip_id.clone(),
        service_date: m.service_date,
        stop_path_index: m.stop_path_index,
        distance_along_m: m.distance_along_segment,
        at: m.matched_at,
        entered_at: None,
        arrived_at_terminal: false,
    };
    let mut progress = Progress::default();

    let Some(trip) = graph.trip(&m.trip_id) else {
        return (next, progress);
    };
    let Some(pattern) = graph.pattern_for(trip) else {
        return (next, progress);
    };
    let source = EventSource {
        graph,
        trip,
        pattern,
        m,
    };
    let last_index = pattern.stop_paths.len().saturating_sub(1);

    let continuing = previous
        .filter(|p| p.trip_id == m.trip_id && p.service_date == m.service_date && p.at < m.matched_at);

    if let Some(p) = continuing {
        if m.stop_path_index == p.stop_path_index {
            next.entered_at = p.entered_at;
            next.arrived_at_terminal = p.arrived_at_terminal;
        } else if m.stop_path_index > p.stop_path_index {
            let total = pattern.distance_between(
                p.stop_path_index,
                p.distance_along_m,
                m.stop_path_index - 1,
            ) + m.distance_along_segment;
            let elapsed_ms = (m.matched_at - p.at).num_milliseconds() as f64;
            let crossing = |k: usize| {
                let d = pattern.distance_between(p.stop_path_index, p.distance_along_m, k);
                let share = if total > 0.0 { (d / total).clamp(0.0, 1.0) } else { 1.0 };
                p.at + Duration::milliseconds((elapsed_ms * share).round() as i64)
            };

            let mut entered = p.entered_at;
            for k in p.stop_path_index..m.stop_path_index {
                let exit = crossing(k);
                if let (Some(entry), true) = (entered, k > 0) {
                    progress.completed.push(CompletedTraversal {
                        segment_id: pattern.stop_paths[k].id.clone(),
                        entered_at: entry,
                        seconds: (exit - entry).num_milliseconds() as f64 / 1000.0,
                    });
                }
                if k > 0 {
                    progress.events.push(source.event(k, StopEventKind::Arrival, exit));
                }
                progress.events.push(source.event(k, StopEventKind::Departure, exit));
                entered = Some(exit);
            }
            next.entered_at = entered;
        }
    }

    // Reaching the terminal stop closes the last path; clearing the entry
    // time keeps it from being recorded twice.
    if m.stop_path_index == last_index && m.stop_path_index > 0 && m.remaining_m <= trip_end_tolerance_m {
        if let Some(entry) = next.entered_at.take() {
            progress.completed.push(CompletedTraversal {
                segment_id: pattern.stop_paths[last_index].id.clone(),
                entered_at: entry,
                seconds: (m.matched_at - entry).num_milliseconds() as f64 / 1000.0,
            });
        }
        if !next.arrived_at_terminal {
            next.arrived_at_terminal = true;
            progress
                .events
                .push(source.event(last_index, StopEventKind::Arrival, m.matched_at));
        }
    }

    (next, progress)
}
