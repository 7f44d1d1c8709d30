//! Match confidence scoring.
//!
//! Confidence is the product of three factors in `[0, 1]`:
//! - distance: `1 - perpendicular / max_distance`
//! - heading: `(1 + cos(diff)) / 2` when both the report and the path piece
//!   have a direction, otherwise 1
//! - age: `1 / (1 + gap / age_scale)` where `gap` is the time since the
//!   previous match, or 1 when there is none

use crate::config::MatchConfig;

pub fn distance_factor(config: &MatchConfig, perpendicular_m: f64) -> f64 {
    if config.max_distance_from_segment_m <= 0.0 {
        return 0.0;
    }
    (1.0 - perpendicular_m / config.max_distance_from_segment_m).clamp(0.0, 1.0)
}

pub fn heading_factor(heading_diff_deg: Option<f64>) -> f64 {
    heading_diff_deg.map_or(1.0, |d| (1.0 + d.to_radians().cos()) / 2.0)
}

pub fn age_factor(config: &MatchConfig, secs_since_previous: Option<f64>) -> f64 {
    match secs_since_previous {
        Some(gap) if config.confidence_age_scale_secs > 0.0 => {
            1.0 / (1.0 + gap.max(0.0) / config.confidence_age_scale_secs)
        }
        _ => 1.0,
    }
}

pub fn confidence(
    config: &MatchConfig,
    perpendicular_m: f64,
    heading_diff_deg: Option<f64>,
    secs_since_previous: Option<f64>,
) -> f64 {
    distance_factor(config, perpendicular_m)
        * heading_factor(heading_diff_deg)
        * age_factor(config, secs_since_previous)
}
