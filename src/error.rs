//! Error taxonomy for per-vehicle processing, prediction, feed output and
//! schedule construction.
//!
//! None of the per-vehicle errors abort processing of other vehicles. The only
//! fatal kind is [`ReportError::StoreCapacityExceeded`].

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReportError {
    #[error("invalid report from vehicle {vehicle_id}: {reason}")]
    InputValidation { vehicle_id: String, reason: String },

    #[error("stale report from vehicle {vehicle_id}: {timestamp} is not after {last_accepted}")]
    StaleReport {
        vehicle_id: String,
        timestamp: DateTime<Utc>,
        last_accepted: DateTime<Utc>,
    },

    #[error("report from vehicle {vehicle_id} only {interval_secs}s after the previous one")]
    TooFrequent { vehicle_id: String, interval_secs: i64 },

    #[error("processing of vehicle {vehicle_id} exceeded its {deadline:?} deadline")]
    DeadlineExceeded { vehicle_id: String, deadline: Duration },

    #[error("vehicle state store is full ({capacity} vehicles)")]
    StoreCapacityExceeded { capacity: usize },
}

impl ReportError {
    /// Resource exhaustion is the only condition that stops the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReportError::StoreCapacityExceeded { .. })
    }

    pub fn invalid(vehicle_id: &str, reason: impl Into<String>) -> Self {
        ReportError::InputValidation {
            vehicle_id: vehicle_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PredictionError {
    #[error("predictions suppressed for vehicle {vehicle_id}: {reason}")]
    Suppressed { vehicle_id: String, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("cannot serialize record for vehicle {vehicle_id}: {reason}")]
    Serialization { vehicle_id: String, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScheduleError {
    #[error("unknown {kind} '{id}' referenced by {referenced_by}")]
    UnknownReference {
        kind: &'static str,
        id: String,
        referenced_by: String,
    },

    #[error("block {block_id}: trip {trip_id} starts before trip {previous_trip_id} ends")]
    OverlappingTrips {
        block_id: String,
        trip_id: String,
        previous_trip_id: String,
    },

    #[error("trip {trip_id} has {times} stop times for a pattern of {stops} stops")]
    ScheduleLength {
        trip_id: String,
        times: usize,
        stops: usize,
    },

    #[error("trip {trip_id}: stop times decrease at stop index {index}")]
    DecreasingTimes { trip_id: String, index: usize },

    #[error("stop path {path_id} has no geometry")]
    EmptyGeometry { path_id: String },

    #[error("invalid timezone '{0}'")]
    Timezone(String),
}
