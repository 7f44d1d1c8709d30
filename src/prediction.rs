//! Arrival and departure predictions for the stops ahead of a vehicle.
//!
//! Predictions are rebuilt from scratch on every matched report: starting at
//! the vehicle's position, travel-time estimates are accumulated path by
//! path through the rest of the trip and on into the next trip of the block,
//! until the horizon is reached. Stops close to the vehicle are nudged
//! toward their scheduled time by a bounded amount that fades with distance.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::assignment::Assignment;
use crate::config::PredictionConfig;
use crate::error::PredictionError;
use crate::matching::Match;
use crate::schedule::{DayType, ScheduleGraph, Trip, TripPattern};
use crate::travel_time::TravelTimeModel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub vehicle_id: String,
    pub trip_id: String,
    pub route_id: String,
    pub service_date: NaiveDate,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub predicted_arrival: DateTime<Utc>,
    pub predicted_departure: DateTime<Utc>,
    /// Predicted minus scheduled arrival; positive is late.
    pub schedule_deviation_seconds: i64,
    pub confidence: f64,
}

/// A stop reached while walking the block forward, before correction.
struct RawStop<'g> {
    trip: &'g Trip,
    stop_index: usize,
    distance_m: f64,
    arrival: f64,
    departure: f64,
}

#[derive(Debug, Clone)]
pub struct PredictionEngine {
    config: PredictionConfig,
}

impl PredictionEngine {
    pub fn new(config: PredictionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    /// Predictions for every stop ahead of `m` within the horizon, ordered
    /// and non-decreasing in time.
    pub fn predict(
        &self,
        graph: &ScheduleGraph,
        model: &TravelTimeModel,
        assignment: &Assignment,
        m: &Match,
    ) -> Result<Vec<Prediction>, PredictionError> {
        let suppressed = |reason: &str| PredictionError::Suppressed {
            vehicle_id: m.vehicle_id.clone(),
            reason: reason.to_string(),
        };

        let day_type = graph.day_type(m.service_date);

        if assignment.is_layover() {
            // Waiting at the end of the matched trip for the assigned one.
            let at_trip_end = graph
                .trip(&m.trip_id)
                .and_then(|t| graph.pattern_for(t))
                .is_some_and(|p| m.stop_path_index + 1 >= p.stop_paths.len());
            let next = graph
                .next_trip_in_block(&m.trip_id, m.service_date)
                .filter(|next| at_trip_end && assignment.trip_id.as_deref() == Some(next.id.as_str()))
                .ok_or_else(|| suppressed("layover trip does not follow the matched trip"))?;
            let pattern = graph
                .pattern_for(next)
                .ok_or_else(|| suppressed("pattern not in schedule"))?;
            let raw = self.walk_block(graph, model, day_type, m, next, pattern, 0, 0.0);
            return Ok(self.finish(graph, m, raw));
        }

        if !assignment.is_assigned() {
            return Err(suppressed(&format!("assignment is {}", assignment.state)));
        }
        if assignment.trip_id.as_deref() != Some(m.trip_id.as_str()) {
            return Err(suppressed("match is not on the assigned trip"));
        }
        let trip = graph
            .trip(&m.trip_id)
            .ok_or_else(|| suppressed("trip not in schedule"))?;
        let pattern = graph
            .pattern_for(trip)
            .ok_or_else(|| suppressed("pattern not in schedule"))?;

        let raw = self.walk_block(
            graph,
            model,
            day_type,
            m,
            trip,
            pattern,
            m.stop_path_index,
            m.remaining_m,
        );
        Ok(self.finish(graph, m, raw))
    }

    /// Keeps previously published predictions while they are younger than
    /// the grace period, then drops them.
    pub fn retain_within_grace(
        &self,
        previous: &[Prediction],
        produced_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Vec<Prediction> {
        match produced_at {
            Some(at) if now - at <= Duration::seconds(self.config.grace_secs) => previous.to_vec(),
            _ => Vec::new(),
        }
    }

    /// Accumulates uncorrected times, in seconds after `m.matched_at`,
    /// starting `remaining_m` before the end of path `start_index`.
    #[allow(clippy::too_many_arguments)]
    fn walk_block<'g>(
        &self,
        graph: &'g ScheduleGraph,
        model: &TravelTimeModel,
        day_type: DayType,
        m: &Match,
        first_trip: &'g Trip,
        first_pattern: &'g TripPattern,
        mut start_index: usize,
        remaining_m: f64,
    ) -> Vec<RawStop<'g>> {
        let horizon = self.config.horizon_secs as f64;
        let mut stops = Vec::new();
        let mut trip = first_trip;
        let mut pattern = first_pattern;
        let mut clock = 0.0;
        let mut distance = 0.0;
        let mut on_current_path = true;

        loop {
            for idx in start_index..pattern.stop_paths.len() {
                let path = &pattern.stop_paths[idx];
                // Only part of the vehicle's current path is still ahead.
                let (share, meters) = if on_current_path {
                    on_current_path = false;
                    let length = path.length_m();
                    let share = if length > 0.0 { remaining_m / length } else { 0.0 };
                    (share.clamp(0.0, 1.0), remaining_m)
                } else {
                    (1.0, path.length_m())
                };

                let at = m.matched_at + to_duration(clock);
                let full = self.segment_secs(graph, model, day_type, trip, idx, at);
                let arrival = clock + full * share;
                distance += meters;

                let departure = if idx == 0 {
                    let scheduled = graph
                        .scheduled_instant(m.service_date, trip.schedule[0].departure_secs)
                        .map_or(arrival, |s| seconds_between(m.matched_at, s));
                    arrival.max(scheduled)
                } else {
                    arrival + self.config.dwell_secs
                };

                if arrival > horizon {
                    return stops;
                }
                stops.push(RawStop {
                    trip,
                    stop_index: idx,
                    distance_m: distance,
                    arrival,
                    departure,
                });
                clock = departure;
            }

            let Some(next) = graph.next_trip_in_block(&trip.id, m.service_date) else {
                return stops;
            };
            let Some(next_pattern) = graph.pattern_for(next) else {
                return stops;
            };
            trip = next;
            pattern = next_pattern;
            start_index = 0;
        }
    }

    /// Estimated full traversal of path `idx`, falling back to the trip's
    /// own scheduled time when the model knows nothing about the segment.
    fn segment_secs(
        &self,
        graph: &ScheduleGraph,
        model: &TravelTimeModel,
        day_type: DayType,
        trip: &Trip,
        idx: usize,
        at: DateTime<Utc>,
    ) -> f64 {
        let Some(path) = graph.pattern_for(trip).and_then(|p| p.stop_paths.get(idx)) else {
            return 0.0;
        };
        model
            .estimate(&path.id, graph.seconds_into_day(at), day_type)
            .unwrap_or_else(|| {
                if idx == 0 {
                    0.0
                } else {
                    (trip.schedule[idx].arrival_secs - trip.schedule[idx - 1].departure_secs) as f64
                }
            })
            .max(0.0)
    }

    fn finish(&self, graph: &ScheduleGraph, m: &Match, raw: Vec<RawStop<'_>>) -> Vec<Prediction> {
        let mut floor = f64::NEG_INFINITY;
        let mut predictions = Vec::with_capacity(raw.len());

        for stop in raw {
            let Some(path) = graph
                .pattern_for(stop.trip)
                .and_then(|p| p.stop_paths.get(stop.stop_index))
            else {
                continue;
            };
            let scheduled = stop.trip.schedule[stop.stop_index];
            let scheduled_arrival = graph
                .scheduled_instant(m.service_date, scheduled.arrival_secs)
                .map(|s| seconds_between(m.matched_at, s));

            let correction = scheduled_arrival.map_or(0.0, |s| {
                let weight = self.config.correction_weight
                    * (-stop.distance_m / self.config.correction_decay_m.max(1.0)).exp();
                (weight * (s - stop.arrival))
                    .clamp(-self.config.max_correction_secs, self.config.max_correction_secs)
            });

            let arrival = (stop.arrival + correction).max(floor).max(0.0);
            // A held terminal departure is set by the schedule, not the correction.
            let departure = if stop.stop_index == 0 {
                stop.departure.max(arrival)
            } else {
                (stop.departure + correction).max(arrival)
            };
            floor = departure;

            let deviation = scheduled_arrival.map_or(0, |s| (arrival - s).round() as i64);
            let confidence =
                m.confidence * (-arrival / self.config.confidence_horizon_secs.max(1.0)).exp();

            predictions.push(Prediction {
                vehicle_id: m.vehicle_id.clone(),
                trip_id: stop.trip.id.clone(),
                route_id: stop.trip.route_id.clone(),
                service_date: m.service_date,
                stop_id: path.stop_id.clone(),
                stop_sequence: path.stop_sequence,
                predicted_arrival: m.matched_at + to_duration(arrival),
                predicted_departure: m.matched_at + to_duration(departure),
                schedule_deviation_seconds: deviation,
                confidence,
            });
        }
        predictions
    }
}

fn to_duration(secs: f64) -> Duration {
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}
