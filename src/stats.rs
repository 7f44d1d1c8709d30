//! Coverage summary of a GTFS-realtime feed.
//!
//! Used for both sides of the tracker: the `inspect` command summarizes any
//! upstream feed, and the publisher summarizes every feed it writes.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::gtfs_rt::FeedMessage;

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct FeedStats {
    pub timestamp: DateTime<Utc>,
    pub feed_name: Option<String>,
    pub feed_version: Option<String>,
    pub header_timestamp: Option<u64>,
    pub total_entities: usize,

    // entity types
    pub vehicles: usize,
    pub trip_updates: usize,
    pub alerts: usize,

    // vehicle fields
    pub with_trip: usize,
    pub with_vehicle_descriptor: usize,
    pub with_position: usize,
    pub with_bearing: usize,
    pub with_speed: usize,
    pub with_current_stop_sequence: usize,
    pub with_stop_id: usize,
    pub with_current_status: usize,
    pub with_timestamp: usize,
    pub with_congestion_level: usize,
    pub with_occupancy: usize,

    // trip update fields
    pub stop_time_updates: usize,
    pub with_arrival_time: usize,
    pub with_delay: usize,

    /// Records the generator left out of this feed.
    pub skipped_records: usize,
    pub encoded_bytes: usize,

    // error tracking
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl FeedStats {
    pub fn from_feed(feed: &FeedMessage) -> Self {
        let mut s = FeedStats {
            timestamp: Utc::now(),
            feed_version: feed.header.feed_version.clone(),
            header_timestamp: feed.header.timestamp,
            total_entities: feed.entity.len(),
            ..Default::default()
        };

        for e in &feed.entity {
            if let Some(v) = &e.vehicle {
                s.vehicles += 1;

                if v.trip.is_some() {
                    s.with_trip += 1;
                }
                if v.vehicle.is_some() {
                    s.with_vehicle_descriptor += 1;
                }
                if let Some(pos) = &v.position {
                    s.with_position += 1;
                    if pos.bearing.is_some() {
                        s.with_bearing += 1;
                    }
                    if pos.speed.is_some() {
                        s.with_speed += 1;
                    }
                }
                if v.current_stop_sequence.is_some() {
                    s.with_current_stop_sequence += 1;
                }
                if v.stop_id.is_some() {
                    s.with_stop_id += 1;
                }
                if v.current_status.is_some() {
                    s.with_current_status += 1;
                }
                if v.timestamp.is_some() {
                    s.with_timestamp += 1;
                }
                if v.congestion_level.is_some() {
                    s.with_congestion_level += 1;
                }
                if v.occupancy_status.is_some() || v.occupancy_percentage.is_some() {
                    s.with_occupancy += 1;
                }
            }

            if let Some(tu) = &e.trip_update {
                s.trip_updates += 1;
                for u in &tu.stop_time_update {
                    s.stop_time_updates += 1;
                    if u.arrival.as_ref().is_some_and(|a| a.time.is_some()) {
                        s.with_arrival_time += 1;
                    }
                    if u.arrival.as_ref().is_some_and(|a| a.delay.is_some()) {
                        s.with_delay += 1;
                    }
                }
            }

            if e.alert.is_some() {
                s.alerts += 1;
            }
        }

        s
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    /// Share of vehicles placed on a trip.
    pub fn matched_pct(&self) -> f64 {
        Self::pct(self.with_trip, self.vehicles)
    }

    pub fn bearing_pct(&self) -> f64 {
        Self::pct(self.with_bearing, self.vehicles)
    }

    /// Create an error record with timestamp and error information
    pub fn from_error(feed_name: &str, error_type: &str, error_message: &str) -> Self {
        FeedStats {
            timestamp: Utc::now(),
            feed_name: Some(feed_name.to_string()),
            error_type: Some(error_type.to_string()),
            error_message: Some(error_message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, feed_name: &str) -> Self {
        self.feed_name = Some(feed_name.to_string());
        self
    }
}
