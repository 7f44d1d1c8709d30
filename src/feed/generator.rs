//! Store snapshot to GTFS-realtime.
//!
//! Every vehicle in the snapshot yields a `VehiclePosition`. Matched
//! vehicles carry their trip and next stop; unmatched and LOST vehicles are
//! published with their raw position and no trip. Each (vehicle, trip) pair
//! with live predictions yields a `TripUpdate`.

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::assignment::AssignmentState;
use crate::error::FeedError;
use crate::gtfs_rt::{
    FeedEntity, FeedHeader, FeedMessage, Position, TripDescriptor, TripUpdate, VehicleDescriptor,
    VehiclePosition, feed_header, trip_descriptor, trip_update, vehicle_position,
};
use crate::matching::Match;
use crate::prediction::Prediction;
use crate::schedule::ScheduleGraph;
use crate::store::VehicleState;

pub const GTFS_RT_VERSION: &str = "2.0";

/// A generated feed plus the records that had to be left out.
#[derive(Debug, Clone, Default)]
pub struct GeneratedFeed {
    pub message: FeedMessage,
    pub skipped: Vec<FeedError>,
}

#[derive(Debug, Clone)]
pub struct FeedGenerator {
    stopped_at_distance_m: f64,
    grace_secs: i64,
}

impl FeedGenerator {
    pub fn new(stopped_at_distance_m: f64, grace_secs: i64) -> Self {
        Self {
            stopped_at_distance_m,
            grace_secs,
        }
    }

    pub fn generate(
        &self,
        graph: &ScheduleGraph,
        snapshot: &[Arc<VehicleState>],
        now: DateTime<Utc>,
    ) -> GeneratedFeed {
        let mut states: Vec<&VehicleState> = snapshot.iter().map(Arc::as_ref).collect();
        states.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));

        let mut entity = Vec::with_capacity(states.len() * 2);
        let mut skipped = Vec::new();

        for state in states {
            match self.vehicle_entity(graph, state) {
                Ok(e) => entity.push(e),
                Err(e) => {
                    warn!(error = %e, "Skipping vehicle position");
                    skipped.push(e);
                    continue;
                }
            }
            for predictions in self.live_trips(state, now) {
                match trip_update_entity(graph, state, predictions) {
                    Ok(e) => entity.push(e),
                    Err(e) => {
                        warn!(error = %e, "Skipping trip update");
                        skipped.push(e);
                    }
                }
            }
        }

        debug!(entities = entity.len(), skipped = skipped.len(), "Feed generated");
        GeneratedFeed {
            message: FeedMessage {
                header: FeedHeader {
                    gtfs_realtime_version: GTFS_RT_VERSION.to_string(),
                    incrementality: Some(feed_header::Incrementality::FullDataset as i32),
                    timestamp: Some(now.timestamp().max(0) as u64),
                    feed_version: Some(graph.version().to_string()),
                },
                entity,
            },
            skipped,
        }
    }

    fn vehicle_entity(&self, graph: &ScheduleGraph, state: &VehicleState) -> Result<FeedEntity, FeedError> {
        let report = &state.report;
        let timestamp = unix_secs(&state.vehicle_id, report.timestamp)?;
        let latitude = report.latitude as f32;
        let longitude = report.longitude as f32;
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(serialization(&state.vehicle_id, "position is not finite"));
        }

        let mut vehicle = VehiclePosition {
            vehicle: Some(vehicle_descriptor(&state.vehicle_id)),
            position: Some(Position {
                latitude,
                longitude,
                bearing: report.heading.map(|h| h as f32),
                odometer: None,
                speed: report.speed.map(|s| s as f32),
            }),
            timestamp: Some(timestamp),
            ..Default::default()
        };

        if let Some(m) = state.current_match.as_ref().filter(|_| is_tracked(state)) {
            vehicle.trip = Some(trip_descriptor(graph, &m.trip_id, &m.route_id, m.service_date));
            vehicle.stop_id = Some(m.stop_id.clone());
            vehicle.current_stop_sequence = Some(m.stop_sequence);
            vehicle.current_status = Some(self.stop_status(m) as i32);
        }

        Ok(FeedEntity {
            id: entity_id(&state.vehicle_id)?,
            vehicle: Some(vehicle),
            ..Default::default()
        })
    }

    fn stop_status(&self, m: &Match) -> vehicle_position::VehicleStopStatus {
        if m.remaining_m <= self.stopped_at_distance_m {
            vehicle_position::VehicleStopStatus::StoppedAt
        } else {
            vehicle_position::VehicleStopStatus::InTransitTo
        }
    }

    /// Predictions still publishable at `now`, grouped by trip in stop order.
    fn live_trips<'s>(&self, state: &'s VehicleState, now: DateTime<Utc>) -> Vec<&'s [Prediction]> {
        state
            .live_predictions(now, self.grace_secs)
            .chunk_by(|a, b| a.trip_id == b.trip_id && a.service_date == b.service_date)
            .collect()
    }
}

fn is_tracked(state: &VehicleState) -> bool {
    !matches!(state.assignment.state, AssignmentState::Lost)
}

fn trip_update_entity(
    graph: &ScheduleGraph,
    state: &VehicleState,
    predictions: &[Prediction],
) -> Result<FeedEntity, FeedError> {
    let Some(first) = predictions.first() else {
        return Err(serialization(&state.vehicle_id, "empty prediction group"));
    };

    let stop_time_update = predictions
        .iter()
        .map(|p| {
            let delay = i32::try_from(p.schedule_deviation_seconds)
                .map_err(|_| serialization(&p.vehicle_id, "schedule deviation out of range"))?;
            let dwell = (p.predicted_departure - p.predicted_arrival).num_seconds();
            let departure_delay = i32::try_from(p.schedule_deviation_seconds + dwell)
                .map_err(|_| serialization(&p.vehicle_id, "departure delay out of range"))?;
            Ok(trip_update::StopTimeUpdate {
                stop_sequence: Some(p.stop_sequence),
                stop_id: Some(p.stop_id.clone()),
                arrival: Some(trip_update::StopTimeEvent {
                    delay: Some(delay),
                    time: Some(p.predicted_arrival.timestamp()),
                    uncertainty: None,
                    scheduled_time: None,
                }),
                departure: Some(trip_update::StopTimeEvent {
                    delay: Some(departure_delay),
                    time: Some(p.predicted_departure.timestamp()),
                    uncertainty: None,
                    scheduled_time: None,
                }),
                schedule_relationship: Some(
                    trip_update::stop_time_update::ScheduleRelationship::Scheduled as i32,
                ),
            })
        })
        .collect::<Result<Vec<_>, FeedError>>()?;

    let delay = stop_time_update
        .first()
        .and_then(|u| u.arrival.as_ref())
        .and_then(|a| a.delay);

    Ok(FeedEntity {
        id: format!("{}:{}", entity_id(&state.vehicle_id)?, first.trip_id),
        trip_update: Some(TripUpdate {
            trip: trip_descriptor(graph, &first.trip_id, &first.route_id, first.service_date),
            vehicle: Some(vehicle_descriptor(&state.vehicle_id)),
            stop_time_update,
            timestamp: Some(unix_secs(&state.vehicle_id, state.report.timestamp)?),
            delay,
        }),
        ..Default::default()
    })
}

fn trip_descriptor(graph: &ScheduleGraph, trip_id: &str, route_id: &str, date: NaiveDate) -> TripDescriptor {
    let trip = graph.trip(trip_id);
    TripDescriptor {
        trip_id: Some(trip_id.to_string()),
        route_id: Some(route_id.to_string()),
        direction_id: trip.and_then(|t| t.direction_id),
        start_time: trip.map(|t| format_schedule_time(t.start_secs())),
        start_date: Some(date.format("%Y%m%d").to_string()),
        schedule_relationship: Some(trip_descriptor::ScheduleRelationship::Scheduled as i32),
    }
}

fn vehicle_descriptor(vehicle_id: &str) -> VehicleDescriptor {
    VehicleDescriptor {
        id: Some(vehicle_id.to_string()),
        label: None,
        license_plate: None,
    }
}

/// `HH:MM:SS`, hours allowed past 24.
pub fn format_schedule_time(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn entity_id(vehicle_id: &str) -> Result<String, FeedError> {
    if vehicle_id.is_empty() {
        return Err(serialization(vehicle_id, "empty vehicle id"));
    }
    Ok(vehicle_id.to_string())
}

fn unix_secs(vehicle_id: &str, at: DateTime<Utc>) -> Result<u64, FeedError> {
    u64::try_from(at.timestamp()).map_err(|_| serialization(vehicle_id, "timestamp before 1970"))
}

fn serialization(vehicle_id: &str, reason: &str) -> FeedError {
    FeedError::Serialization {
        vehicle_id: vehicle_id.to_string(),
        reason: reason.to_string(),
    }
}
