//! Streaming per-segment travel-time statistics.
//!
//! Buckets are keyed by segment, time-of-day bucket and day type. Each one
//! keeps a Welford mean/variance accumulator. Once a bucket reaches
//! `max_effective_samples` its count stops growing, so each new observation
//! keeps a fixed weight and old history decays geometrically instead of
//! being deleted.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::TravelTimeConfig;
use crate::schedule::DayType;

/// Persisted form of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelTimeStat {
    pub segment_id: String,
    pub time_of_day_bucket: u32,
    pub day_type: DayType,
    pub sample_count: u64,
    pub mean_traversal_seconds: f64,
    pub variance: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    segment_id: String,
    bucket: u32,
    day_type: DayType,
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Accumulator {
    fn push(&mut self, x: f64, cap: u64) {
        let cap = cap.max(2);
        if self.count >= cap {
            self.m2 *= (cap - 1) as f64 / self.count as f64;
            self.count = cap - 1;
        }
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }
}

#[derive(Debug)]
pub struct TravelTimeModel {
    config: TravelTimeConfig,
    buckets: DashMap<BucketKey, Accumulator>,
    fallbacks: DashMap<String, f64>,
}

impl TravelTimeModel {
    pub fn new(config: TravelTimeConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            fallbacks: DashMap::new(),
        }
    }

    pub fn bucket_for(&self, time_of_day_secs: u32) -> u32 {
        time_of_day_secs / self.config.bucket_secs.max(1)
    }

    /// Registers scheduled durations used before enough history exists.
    /// Called for each schedule version; entries for segments that vanished
    /// are kept, since old buckets may still be looked up.
    pub fn set_fallbacks(&self, scheduled: &HashMap<String, f64>) {
        for (segment_id, secs) in scheduled {
            self.fallbacks.insert(segment_id.clone(), *secs);
        }
    }

    pub fn fallback(&self, segment_id: &str) -> Option<f64> {
        self.fallbacks.get(segment_id).map(|v| *v)
    }

    /// Estimated traversal time of `segment_id` starting at
    /// `time_of_day_secs` on a `day_type` day.
    ///
    /// With no samples this is exactly the scheduled fallback. Below
    /// `min_samples` the bucket mean is blended with the fallback in
    /// proportion to the sample count. `None` when there is neither history
    /// nor a fallback.
    pub fn estimate(&self, segment_id: &str, time_of_day_secs: u32, day_type: DayType) -> Option<f64> {
        let fallback = self.fallback(segment_id);
        let key = BucketKey {
            segment_id: segment_id.to_string(),
            bucket: self.bucket_for(time_of_day_secs),
            day_type,
        };
        let acc = self.buckets.get(&key).map(|a| *a).unwrap_or_default();

        if acc.count == 0 {
            return fallback;
        }
        match fallback {
            Some(fb) if acc.count < self.config.min_samples => {
                let w = acc.count as f64 / self.config.min_samples as f64;
                Some(w * acc.mean + (1.0 - w) * fb)
            }
            _ => Some(acc.mean),
        }
    }

    /// Adds one completed traversal. Returns false if the observation is
    /// outside the plausible range and was discarded.
    pub fn record(
        &self,
        segment_id: &str,
        time_of_day_secs: u32,
        day_type: DayType,
        observed_secs: f64,
    ) -> bool {
        if !observed_secs.is_finite()
            || observed_secs < self.config.min_observation_secs
            || observed_secs > self.config.max_observation_secs
        {
            debug!(segment_id, observed_secs, "Discarding implausible traversal");
            return false;
        }

        let key = BucketKey {
            segment_id: segment_id.to_string(),
            bucket: self.bucket_for(time_of_day_secs),
            day_type,
        };
        self.buckets
            .entry(key)
            .or_default()
            .push(observed_secs, self.config.max_effective_samples);
        true
    }

    /// Replaces the buckets named in `stats` with their persisted values.
    pub fn seed(&self, stats: &[TravelTimeStat]) {
        for stat in stats {
            let key = BucketKey {
                segment_id: stat.segment_id.clone(),
                bucket: stat.time_of_day_bucket,
                day_type: stat.day_type,
            };
            let m2 = if stat.sample_count > 1 {
                stat.variance * (stat.sample_count - 1) as f64
            } else {
                0.0
            };
            self.buckets.insert(
                key,
                Accumulator {
                    count: stat.sample_count,
                    mean: stat.mean_traversal_seconds,
                    m2,
                },
            );
        }
    }

    /// Every bucket with at least one sample, ordered by key.
    pub fn snapshot(&self) -> Vec<TravelTimeStat> {
        let mut stats: Vec<TravelTimeStat> = self
            .buckets
            .iter()
            .filter(|e| e.value().count > 0)
            .map(|e| TravelTimeStat {
                segment_id: e.key().segment_id.clone(),
                time_of_day_bucket: e.key().bucket,
                day_type: e.key().day_type,
                sample_count: e.value().count,
                mean_traversal_seconds: e.value().mean,
                variance: e.value().variance(),
            })
            .collect();
        stats.sort_by(|a, b| {
            (&a.segment_id, a.time_of_day_bucket, a.day_type)
                .cmp(&(&b.segment_id, b.time_of_day_bucket, b.day_type))
        });
        stats
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    const PEAK: u32 = 8 * 3600 + 15 * 60;

    fn model_with_fallback(segment: &str, secs: f64) -> TravelTimeModel {
        let model = TravelTimeModel::new(TravelTimeConfig::default());
        model.set_fallbacks(&HashMap::from([(segment.to_string(), secs)]));
        model
    }

    #[test]
    fn test_empty_bucket_returns_exact_fallback() {
        let model = model_with_fallback("S", 90.0);
        assert_eq!(model.estimate("S", PEAK, DayType::Weekday), Some(90.0));
        assert_eq!(model.estimate("unknown", PEAK, DayType::Weekday), None);
    }

    #[test]
    fn test_converges_to_recorded_mean() {
        let model = model_with_fallback("S", 90.0);
        for _ in 0..50 {
            assert!(model.record("S", PEAK, DayType::Weekday, 110.0));
        }
        let estimate = model.estimate("S", PEAK, DayType::Weekday).unwrap();
        assert_relative_eq!(estimate, 110.0, epsilon = 0.5);

        // Other buckets and day types are untouched.
        assert_eq!(model.estimate("S", PEAK, DayType::Saturday), Some(90.0));
        assert_eq!(model.estimate("S", 3 * 3600, DayType::Weekday), Some(90.0));
    }

    #[test]
    fn test_blend_below_min_samples() {
        let model = model_with_fallback("S", 100.0);
        for _ in 0..5 {
            model.record("S", PEAK, DayType::Weekday, 200.0);
        }
        // 5 of 10 samples: halfway between fallback and mean.
        assert_relative_eq!(model.estimate("S", PEAK, DayType::Weekday).unwrap(), 150.0);
    }

    #[test]
    fn test_known_distribution_converges() {
        let model = model_with_fallback("S", 60.0);
        // Deterministic spread around 120 s: 120 +/- 30.
        for i in 0..400 {
            let offset = ((i * 37) % 61) as f64 - 30.0;
            model.record("S", PEAK, DayType::Weekday, 120.0 + offset);
        }
        let stat = &model.snapshot()[0];
        assert_relative_eq!(stat.mean_traversal_seconds, 120.0, epsilon = 1.5);
        assert!(stat.variance > 200.0 && stat.variance < 400.0);
    }

    #[test]
    fn test_implausible_observations_rejected() {
        let model = model_with_fallback("S", 90.0);
        assert!(!model.record("S", PEAK, DayType::Weekday, 0.0));
        assert!(!model.record("S", PEAK, DayType::Weekday, 5000.0));
        assert!(!model.record("S", PEAK, DayType::Weekday, f64::NAN));
        assert!(model.is_empty());
    }

    #[test]
    fn test_cap_ages_old_history() {
        let config = TravelTimeConfig {
            max_effective_samples: 20,
            ..TravelTimeConfig::default()
        };
        let model = TravelTimeModel::new(config);
        for _ in 0..200 {
            model.record("S", PEAK, DayType::Weekday, 100.0);
        }
        for _ in 0..100 {
            model.record("S", PEAK, DayType::Weekday, 200.0);
        }
        let stat = &model.snapshot()[0];
        assert_eq!(stat.sample_count, 20);
        assert!(stat.mean_traversal_seconds > 195.0);
    }

    #[test]
    fn test_seed_round_trips_through_snapshot() {
        let model = model_with_fallback("S", 90.0);
        for x in [100.0, 110.0, 120.0] {
            model.record("S", PEAK, DayType::Weekday, x);
        }
        let stats = model.snapshot();

        let restored = model_with_fallback("S", 90.0);
        restored.seed(&stats);
        assert_eq!(restored.snapshot(), stats);
        assert_relative_eq!(stats[0].variance, 100.0);
    }

    #[test]
    fn test_concurrent_records_from_many_threads() {
        let model = Arc::new(model_with_fallback("S", 90.0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let model = Arc::clone(&model);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        model.record("S", PEAK, DayType::Weekday, 100.0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stat = &model.snapshot()[0];
        assert_eq!(stat.sample_count, 800);
        assert_relative_eq!(stat.mean_traversal_seconds, 100.0);
    }
}
