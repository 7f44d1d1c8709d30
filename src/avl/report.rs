//! Normalized AVL report shape and the plausibility filters applied before a
//! report may touch vehicle state.

use chrono::{DateTime, Utc};
use geo::Coord;
use serde::{Deserialize, Serialize};

use crate::config::AvlConfig;
use crate::error::ReportError;
use crate::schedule::geometry;

/// One position report from a vehicle. `speed` is in meters per second and
/// `heading` in degrees clockwise from north.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvlReport {
    pub vehicle_id: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub source: String,
}

impl AvlReport {
    pub fn location(&self) -> Coord<f64> {
        Coord {
            x: self.longitude,
            y: self.latitude,
        }
    }

    /// Validates coordinates and cleans optional fields.
    ///
    /// Bad coordinates reject the whole report. A bad heading or speed only
    /// drops that field, and heading is dropped when the vehicle is moving
    /// too slowly for it to mean anything.
    pub fn normalize(mut self, config: &AvlConfig) -> Result<Self, ReportError> {
        self.vehicle_id = self.vehicle_id.trim().to_string();
        if self.vehicle_id.is_empty() {
            return Err(ReportError::invalid("<none>", "empty vehicle id"));
        }

        let (lat, lon) = (self.latitude, self.longitude);
        if !lat.is_finite() || !lon.is_finite() {
            return Err(ReportError::invalid(&self.vehicle_id, "non-finite coordinates"));
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(ReportError::invalid(
                &self.vehicle_id,
                format!("coordinates ({lat}, {lon}) out of range"),
            ));
        }
        if lat < config.min_latitude
            || lat > config.max_latitude
            || lon < config.min_longitude
            || lon > config.max_longitude
        {
            return Err(ReportError::invalid(
                &self.vehicle_id,
                format!("coordinates ({lat}, {lon}) outside the service area"),
            ));
        }
        if config.reject_null_island && lat == 0.0 && lon == 0.0 {
            return Err(ReportError::invalid(&self.vehicle_id, "unset GPS fix at (0, 0)"));
        }

        self.speed = self.speed.filter(|s| s.is_finite() && *s >= 0.0);
        self.heading = self
            .heading
            .filter(|h| h.is_finite() && *h >= 0.0)
            .map(|h| h.rem_euclid(360.0));
        if self
            .speed
            .is_some_and(|s| s < config.min_speed_for_heading_mps)
        {
            self.heading = None;
        }

        Ok(self)
    }

    /// Checks this report against the last accepted one for the same vehicle:
    /// it must be strictly newer, not arrive faster than the configured rate,
    /// and not imply an impossible speed.
    pub fn check_sequence(
        &self,
        previous: Option<&AvlReport>,
        config: &AvlConfig,
    ) -> Result<(), ReportError> {
        let Some(previous) = previous else {
            return Ok(());
        };

        if self.timestamp <= previous.timestamp {
            return Err(ReportError::StaleReport {
                vehicle_id: self.vehicle_id.clone(),
                timestamp: self.timestamp,
                last_accepted: previous.timestamp,
            });
        }

        let elapsed = (self.timestamp - previous.timestamp).num_milliseconds() as f64 / 1000.0;
        if elapsed < config.min_report_interval_secs as f64 {
            return Err(ReportError::TooFrequent {
                vehicle_id: self.vehicle_id.clone(),
                interval_secs: elapsed as i64,
            });
        }

        let moved = geometry::distance_m(previous.location(), self.location());
        let implied = moved / elapsed;
        if implied > config.max_speed_mps {
            return Err(ReportError::invalid(
                &self.vehicle_id,
                format!("implied speed {implied:.1} m/s exceeds {}", config.max_speed_mps),
            ));
        }

        Ok(())
    }
}
