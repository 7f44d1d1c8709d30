//! Per-report processing: validate, match, assign, predict, commit.
//!
//! Everything up to the commit point is a pure computation over the
//! vehicle's previous state. The commit (store write plus travel-time
//! observations) happens only if the lane has not given up on the report,
//! which [`CommitGuard`] decides atomically.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

use super::traversal::{self, ArrivalDeparture, Progress};
use crate::assignment::{Assignment, AssignmentState, BlockAssigner};
use crate::avl::AvlReport;
use crate::config::CoreConfig;
use crate::error::ReportError;
use crate::matching::{MatchOutcome, SpatialMatcher, UnmatchedReason};
use crate::prediction::PredictionEngine;
use crate::schedule::{ScheduleGraph, ScheduleHandle};
use crate::store::{VehicleState, VehicleStateStore};
use crate::travel_time::TravelTimeModel;

const PENDING: u8 = 0;
const COMMITTED: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides, exactly once, whether a report's result is written or dropped.
#[derive(Debug, Default)]
pub struct CommitGuard {
    state: AtomicU8,
}

impl CommitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the processor right before writing. False if the report
    /// was already abandoned.
    pub fn try_commit(&self) -> bool {
        self.state
            .compare_exchange(PENDING, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Called by the lane on deadline. False if the write already started.
    pub fn abandon(&self) -> bool {
        self.state
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Matched,
    Ambiguous,
    Unmatched(UnmatchedReason),
}

/// Summary of a committed report.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub vehicle_id: String,
    pub disposition: Disposition,
    pub assignment: AssignmentState,
    pub predictions: usize,
    pub observations: usize,
    /// Stop arrivals and departures this report revealed.
    pub stop_events: usize,
}

/// All tracking components, wired together once at startup.
pub struct ReportProcessor {
    config: CoreConfig,
    schedule: Arc<ScheduleHandle>,
    matcher: SpatialMatcher,
    assigner: BlockAssigner,
    predictor: PredictionEngine,
    travel_times: Arc<TravelTimeModel>,
    store: Arc<VehicleStateStore>,
}

impl ReportProcessor {
    pub fn new(
        config: CoreConfig,
        schedule: Arc<ScheduleHandle>,
        travel_times: Arc<TravelTimeModel>,
        store: Arc<VehicleStateStore>,
    ) -> Self {
        travel_times.set_fallbacks(schedule.current().scheduled_segment_secs());
        Self {
            matcher: SpatialMatcher::new(config.matching.clone()),
            assigner: BlockAssigner::new(config.assignment.clone()),
            predictor: PredictionEngine::new(config.prediction.clone()),
            config,
            schedule,
            travel_times,
            store,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<VehicleStateStore> {
        &self.store
    }

    pub fn travel_times(&self) -> &Arc<TravelTimeModel> {
        &self.travel_times
    }

    pub fn schedule(&self) -> Arc<ScheduleGraph> {
        self.schedule.current()
    }

    /// Installs a new schedule version. Reports already in flight finish
    /// against the version they started with.
    pub fn replace_schedule(&self, graph: ScheduleGraph) {
        self.travel_times.set_fallbacks(graph.scheduled_segment_secs());
        self.schedule.replace(graph);
    }

    pub fn process(&self, report: AvlReport, guard: &CommitGuard) -> Result<Processed, ReportError> {
        let report = report.normalize(&self.config.avl)?;
        let previous = self.store.get(&report.vehicle_id);
        report.check_sequence(previous.as_ref().map(|s| &s.report), &self.config.avl)?;

        let graph = self.schedule.current();
        let at = report.timestamp;

        let assignment = match &previous {
            Some(state) => self.assigner.reconcile(&graph, &state.assignment, at),
            None => Assignment::unassigned(&report.vehicle_id, at),
        };
        let previous_match = previous
            .as_ref()
            .and_then(|s| s.current_match.as_ref())
            .filter(|m| graph.trip(&m.trip_id).is_some());

        let outcome = self
            .matcher
            .match_report(&graph, &report, Some(&assignment), previous_match);
        let next_assignment = self.assigner.advance(&graph, &assignment, &outcome, at);

        let previous_traversal = previous.as_ref().and_then(|s| s.traversal.as_ref());
        let (traversal, progress) = match outcome.best() {
            Some(m) => {
                let (t, progress) = traversal::advance(
                    &graph,
                    previous_traversal,
                    m,
                    self.config.assignment.trip_end_tolerance_m,
                );
                (Some(t), progress)
            }
            None if next_assignment.state == AssignmentState::Lost => (None, Progress::default()),
            None => (previous_traversal.cloned(), Progress::default()),
        };
        let Progress { completed, events } = progress;
        for e in &events {
            debug!(
                vehicle_id = %e.vehicle_id,
                trip_id = %e.trip_id,
                stop_id = %e.stop_id,
                kind = ?e.kind,
                deviation_secs = ?e.schedule_deviation_secs(),
                "Stop event"
            );
        }
        let stop_events = recent_events(
            previous.as_ref().map(|s| s.stop_events.as_slice()).unwrap_or_default(),
            &events,
            self.config.store.stop_event_history,
        );

        let prediction = outcome.best().map(|m| {
            self.predictor
                .predict(&graph, &self.travel_times, &next_assignment, m)
        });
        let (predictions, predictions_made_at) = match prediction {
            Some(Ok(p)) => (p, Some(at)),
            other => {
                if let Some(Err(e)) = other {
                    debug!(error = %e, "No fresh predictions");
                }
                let (old, made_at) = previous
                    .as_ref()
                    .map(|s| (s.predictions.as_slice(), s.predictions_made_at))
                    .unwrap_or_default();
                let kept = self.predictor.retain_within_grace(old, made_at, at);
                let made_at = if kept.is_empty() { None } else { made_at };
                (kept, made_at)
            }
        };

        let disposition = match &outcome {
            MatchOutcome::Matched(_) => Disposition::Matched,
            MatchOutcome::Ambiguous(_) => Disposition::Ambiguous,
            MatchOutcome::Unmatched(reason) => Disposition::Unmatched(*reason),
        };
        let processed = Processed {
            vehicle_id: report.vehicle_id.clone(),
            disposition,
            assignment: next_assignment.state,
            predictions: predictions.len(),
            observations: completed.len(),
            stop_events: events.len(),
        };

        let state = VehicleState {
            vehicle_id: report.vehicle_id.clone(),
            current_match: outcome.best().cloned(),
            unmatched_reason: match outcome {
                MatchOutcome::Unmatched(reason) => Some(reason),
                _ => None,
            },
            report,
            assignment: next_assignment,
            predictions,
            predictions_made_at,
            traversal,
            stop_events,
            schedule_version: graph.version().to_string(),
        };

        if !guard.try_commit() {
            return Err(ReportError::DeadlineExceeded {
                vehicle_id: state.vehicle_id,
                deadline: self.config.ingest.report_deadline(),
            });
        }

        let service_date = state.current_match.as_ref().map(|m| m.service_date);
        self.store.upsert(state)?;

        if let Some(date) = service_date {
            let day_type = graph.day_type(date);
            for c in &completed {
                self.travel_times.record(
                    &c.segment_id,
                    graph.seconds_into_day(c.entered_at),
                    day_type,
                    c.seconds,
                );
            }
        }

        Ok(processed)
    }
}

/// Appends `new` to `old`, keeping the last `limit` events.
fn recent_events(old: &[ArrivalDeparture], new: &[ArrivalDeparture], limit: usize) -> Vec<ArrivalDeparture> {
    let total = old.len() + new.len();
    old.iter()
        .chain(new)
        .skip(total.saturating_sub(limit))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StopEventKind;
    use crate::schedule::fixtures::{self, KM};
    use crate::schedule::{DayType, ScheduleHandle};
    use chrono::{DateTime, Utc};

    fn processor() -> ReportProcessor {
        processor_with(CoreConfig::default())
    }

    fn processor_with(config: CoreConfig) -> ReportProcessor {
        ReportProcessor::new(
            config.clone(),
            Arc::new(ScheduleHandle::new(fixtures::graph())),
            Arc::new(TravelTimeModel::new(config.travel_times.clone())),
            Arc::new(VehicleStateStore::new(config.store.max_vehicles)),
        )
    }

    fn report(east_m: f64, north_m: f64, at: DateTime<Utc>) -> AvlReport {
        let c = fixtures::point_along(east_m, north_m);
        AvlReport {
            vehicle_id: "V1".into(),
            timestamp: at,
            latitude: c.y,
            longitude: c.x,
            heading: None,
            speed: None,
            source: "test".into(),
        }
    }

    fn run(p: &ReportProcessor, r: AvlReport) -> Result<Processed, ReportError> {
        p.process(r, &CommitGuard::new())
    }

    #[test]
    fn test_commit_guard_decides_once() {
        let guard = CommitGuard::new();
        assert!(guard.try_commit());
        assert!(!guard.abandon());

        let guard = CommitGuard::new();
        assert!(guard.abandon());
        assert!(!guard.try_commit());
    }

    #[test]
    fn test_first_report_assigns_and_predicts() {
        let p = processor();
        let out = run(&p, report(20.0, 5.0, fixtures::at(8, 0, 0))).unwrap();
        assert_eq!(out.disposition, Disposition::Matched);
        assert_eq!(out.assignment, AssignmentState::Assigned);
        assert!(out.predictions > 0);

        let state = p.store().get("V1").unwrap();
        assert_eq!(state.assignment.trip_id.as_deref(), Some("T1"));
        assert_eq!(state.predictions[0].stop_id, "B");
    }

    #[test]
    fn test_rejected_reports_leave_state_untouched() {
        let p = processor();
        run(&p, report(20.0, 5.0, fixtures::at(8, 0, 0))).unwrap();
        let before = p.store().get("V1").unwrap();

        let stale = run(&p, report(420.0, 5.0, fixtures::at(8, 0, 0)));
        assert!(matches!(stale, Err(ReportError::StaleReport { .. })));
        let quick = run(&p, report(30.0, 5.0, fixtures::at(8, 0, 2)));
        assert!(matches!(quick, Err(ReportError::TooFrequent { .. })));
        let mut bad = report(420.0, 5.0, fixtures::at(8, 1, 0));
        bad.latitude = 95.0;
        assert!(matches!(run(&p, bad), Err(ReportError::InputValidation { .. })));

        assert_eq!(*p.store().get("V1").unwrap(), *before);
    }

    #[test]
    fn test_abandoned_report_is_not_written() {
        let p = processor();
        let guard = CommitGuard::new();
        assert!(guard.abandon());
        let result = p.process(report(20.0, 5.0, fixtures::at(8, 0, 0)), &guard);
        assert!(matches!(result, Err(ReportError::DeadlineExceeded { .. })));
        assert!(p.store().get("V1").is_none());
    }

    #[test]
    fn test_completed_segments_feed_travel_times() {
        let p = processor();
        run(&p, report(0.0, 0.0, fixtures::at(8, 0, 0))).unwrap();
        run(&p, report(500.0, 0.0, fixtures::at(8, 1, 0))).unwrap();
        run(&p, report(KM + 500.0, 0.0, fixtures::at(8, 3, 0))).unwrap();
        let out = run(&p, report(2.0 * KM + 500.0, 0.0, fixtures::at(8, 5, 0))).unwrap();
        assert_eq!(out.observations, 1);

        let stats = p.travel_times().snapshot();
        assert!(stats.iter().any(|s| s.segment_id == "A-B" && s.day_type == DayType::Weekday));
        assert!(stats.iter().any(|s| s.segment_id == "B-C"));
    }

    #[test]
    fn test_stop_events_kept_as_bounded_history() {
        let mut config = CoreConfig::default();
        config.store.stop_event_history = 3;
        let p = processor_with(config);
        run(&p, report(0.0, 0.0, fixtures::at(8, 0, 0))).unwrap();
        run(&p, report(500.0, 0.0, fixtures::at(8, 1, 0))).unwrap();
        let out = run(&p, report(KM + 500.0, 0.0, fixtures::at(8, 3, 0))).unwrap();
        assert_eq!(out.stop_events, 2);
        let out = run(&p, report(2.0 * KM + 500.0, 0.0, fixtures::at(8, 5, 0))).unwrap();
        assert_eq!(out.stop_events, 2);

        let state = p.store().get("V1").unwrap();
        let events: Vec<_> = state
            .stop_events
            .iter()
            .map(|e| (e.stop_id.as_str(), e.kind))
            .collect();
        assert_eq!(
            events,
            vec![
                ("B", StopEventKind::Departure),
                ("C", StopEventKind::Arrival),
                ("C", StopEventKind::Departure),
            ]
        );
        assert_eq!(state.stop_events[1].trip_id, "T1");
        assert_eq!(state.stop_events[1].time, fixtures::at(8, 4, 0));
    }

    #[test]
    fn test_schedule_swap_unassigns_vanished_trip() {
        let p = processor();
        run(&p, report(20.0, 5.0, fixtures::at(8, 0, 0))).unwrap();

        let v2 = fixtures::builder_with_version("v2")
            .trip(fixtures::trip("T3", "P_EAST", "B2", 9 * 3600))
            .build()
            .unwrap();
        p.replace_schedule(v2);

        let out = run(&p, report(420.0, 5.0, fixtures::at(8, 1, 0))).unwrap();
        assert_eq!(out.disposition, Disposition::Unmatched(UnmatchedReason::NoActiveTrip));
        let state = p.store().get("V1").unwrap();
        assert_eq!(state.assignment.state, AssignmentState::Unassigned);
        assert_eq!(state.schedule_version, "v2");
    }
}
