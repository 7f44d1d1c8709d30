//! Runtime configuration for the tracking core.
//!
//! Every threshold used by matching, assignment, travel-time bucketing and
//! prediction is a policy parameter. All of them have defaults, so an empty
//! JSON object (or no file at all) is a valid configuration:
//!
//! ```json
//! {
//!   "matching": { "max_distance_from_segment_m": 45.0 },
//!   "ingest": { "lanes": 16 }
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub avl: AvlConfig,
    pub matching: MatchConfig,
    pub assignment: AssignmentConfig,
    pub travel_times: TravelTimeConfig,
    pub prediction: PredictionConfig,
    pub store: StoreConfig,
    pub ingest: IngestConfig,
    pub feed: FeedConfig,
}

impl CoreConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config '{path}'"))?;
        let config: CoreConfig =
            serde_json::from_str(&content).with_context(|| format!("parsing config '{path}'"))?;
        Ok(config)
    }
}

/// Bounds and plausibility filters applied to raw location reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvlConfig {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
    /// Reports exactly at (0, 0) are almost always an unset GPS fix.
    pub reject_null_island: bool,
    pub min_report_interval_secs: u64,
    pub max_speed_mps: f64,
    /// Below this speed the reported heading is noise and is discarded.
    pub min_speed_for_heading_mps: f64,
}

impl Default for AvlConfig {
    fn default() -> Self {
        Self {
            min_latitude: -90.0,
            max_latitude: 90.0,
            min_longitude: -180.0,
            max_longitude: 180.0,
            reject_null_island: true,
            min_report_interval_secs: 5,
            max_speed_mps: 31.3,
            min_speed_for_heading_mps: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub max_distance_from_segment_m: f64,
    /// Candidates within this many meters of the best one are considered tied.
    pub tie_tolerance_m: f64,
    /// How far behind the previous match a report may land and still count as
    /// forward progress.
    pub backtrack_tolerance_m: f64,
    pub min_match_confidence: f64,
    pub confidence_age_scale_secs: f64,
    pub max_heading_offset_deg: f64,
    /// How early before its scheduled start a trip is considered active.
    pub allowable_early_secs: i64,
    /// How late after its scheduled end a trip is considered active.
    pub allowable_late_secs: i64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            max_distance_from_segment_m: 60.0,
            tie_tolerance_m: 1.0,
            backtrack_tolerance_m: 20.0,
            min_match_confidence: 0.2,
            confidence_age_scale_secs: 600.0,
            max_heading_offset_deg: 360.0,
            allowable_early_secs: 900,
            allowable_late_secs: 5400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    pub high_confidence: f64,
    /// Consecutive unmatched reports tolerated before a vehicle is LOST.
    pub allowable_unmatched_reports: u32,
    pub off_block_lost_secs: i64,
    pub lost_cooldown_secs: i64,
    pub layover_window_secs: i64,
    pub trip_end_tolerance_m: f64,
    pub ambiguity_retry_budget: u32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            high_confidence: 0.6,
            allowable_unmatched_reports: 3,
            off_block_lost_secs: 300,
            lost_cooldown_secs: 120,
            layover_window_secs: 3600,
            trip_end_tolerance_m: 50.0,
            ambiguity_retry_budget: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TravelTimeConfig {
    pub bucket_secs: u32,
    /// Below this many samples the estimate is blended with the schedule.
    pub min_samples: u64,
    /// Sample count cap; past it older observations decay geometrically.
    pub max_effective_samples: u64,
    pub min_observation_secs: f64,
    pub max_observation_secs: f64,
}

impl Default for TravelTimeConfig {
    fn default() -> Self {
        Self {
            bucket_secs: 3600,
            min_samples: 10,
            max_effective_samples: 1000,
            min_observation_secs: 1.0,
            max_observation_secs: 1200.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub horizon_secs: i64,
    pub dwell_secs: f64,
    pub max_correction_secs: f64,
    pub correction_weight: f64,
    pub correction_decay_m: f64,
    pub confidence_horizon_secs: f64,
    /// How long predictions outlive the match that produced them.
    pub grace_secs: i64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            horizon_secs: 1800,
            dwell_secs: 0.0,
            max_correction_secs: 60.0,
            correction_weight: 0.5,
            correction_decay_m: 400.0,
            confidence_horizon_secs: 1800.0,
            grace_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_vehicles: usize,
    pub silence_timeout_secs: i64,
    pub expiry_interval_secs: u64,
    /// Arrival/departure events kept per vehicle.
    pub stop_event_history: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_vehicles: 100_000,
            silence_timeout_secs: 900,
            expiry_interval_secs: 30,
            stop_event_history: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub lanes: usize,
    pub lane_capacity: usize,
    pub report_deadline_ms: u64,
    pub poll_interval_secs: u64,
}

impl IngestConfig {
    pub fn report_deadline(&self) -> Duration {
        Duration::from_millis(self.report_deadline_ms)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            lanes: 8,
            lane_capacity: 1024,
            report_deadline_ms: 500,
            poll_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub publish_interval_secs: u64,
    pub stat_handoff_secs: u64,
    /// A matched vehicle this close to its next stop is reported as stopped there.
    pub stopped_at_distance_m: f64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            publish_interval_secs: 15,
            stat_handoff_secs: 300,
            stopped_at_distance_m: 25.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    #[test]
    fn test_empty_object_yields_defaults() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.assignment.allowable_unmatched_reports, 3);
        assert_eq!(config.matching.max_distance_from_segment_m, 60.0);
        assert_eq!(config.ingest.lanes, 8);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"matching": {"tie_tolerance_m": 2.5}}"#).unwrap();
        assert_eq!(config.matching.tie_tolerance_m, 2.5);
        assert_eq!(config.matching.min_match_confidence, 0.2);
        assert_eq!(config.prediction.horizon_secs, 1800);
    }

    #[test]
    fn test_load_from_file() {
        let path = format!("{}/transit_tracker_config_test.json", env::temp_dir().display());
        fs::write(&path, r#"{"store": {"max_vehicles": 12}}"#).unwrap();

        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.store.max_vehicles, 12);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(CoreConfig::load("/definitely/not/here.json").is_err());
    }
}
