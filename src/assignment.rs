//! Block/trip assignment state machine.
//!
//! ```text
//! UNASSIGNED --confident match--> ASSIGNED --trip end, next trip due--> ASSIGNED_LAYOVER
//!      ^                             |   ^                                    |
//!      |                             |   +------first match on new trip-------+
//!   cooldown                         v
//!      +------------------------- LOST  (unmatched or off-block too long,
//!                                        or unresolved ambiguity)
//! ```

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::config::AssignmentConfig;
use crate::matching::{Match, MatchOutcome};
use crate::schedule::ScheduleGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentState {
    Unassigned,
    Assigned,
    AssignedLayover,
    Lost,
}

impl fmt::Display for AssignmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssignmentState::Unassigned => "UNASSIGNED",
            AssignmentState::Assigned => "ASSIGNED",
            AssignmentState::AssignedLayover => "ASSIGNED_LAYOVER",
            AssignmentState::Lost => "LOST",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub vehicle_id: String,
    pub block_id: Option<String>,
    pub trip_id: Option<String>,
    pub service_date: Option<NaiveDate>,
    pub state: AssignmentState,
    /// When the vehicle entered `state`.
    pub since: DateTime<Utc>,
    pub unmatched_reports: u32,
    pub ambiguous_reports: u32,
    /// Start of the current run of matches outside the assigned block.
    pub off_block_since: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn unassigned(vehicle_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            block_id: None,
            trip_id: None,
            service_date: None,
            state: AssignmentState::Unassigned,
            since: at,
            unmatched_reports: 0,
            ambiguous_reports: 0,
            off_block_since: None,
        }
    }

    /// The trip the vehicle is serving or about to serve.
    pub fn current_trip(&self) -> Option<(&str, NaiveDate)> {
        match self.state {
            AssignmentState::Assigned | AssignmentState::AssignedLayover => {
                Some((self.trip_id.as_deref()?, self.service_date?))
            }
            AssignmentState::Unassigned | AssignmentState::Lost => None,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.state == AssignmentState::Assigned
    }

    pub fn is_layover(&self) -> bool {
        self.state == AssignmentState::AssignedLayover
    }

    fn to_trip(&self, m: &Match, state: AssignmentState, at: DateTime<Utc>) -> Self {
        Self {
            vehicle_id: self.vehicle_id.clone(),
            block_id: Some(m.block_id.clone()),
            trip_id: Some(m.trip_id.clone()),
            service_date: Some(m.service_date),
            state,
            since: at,
            unmatched_reports: 0,
            ambiguous_reports: 0,
            off_block_since: None,
        }
    }

    fn lost(&self, at: DateTime<Utc>) -> Self {
        Self {
            state: AssignmentState::Lost,
            since: at,
            block_id: None,
            trip_id: None,
            service_date: None,
            off_block_since: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockAssigner {
    config: AssignmentConfig,
}

impl BlockAssigner {
    pub fn new(config: AssignmentConfig) -> Self {
        Self { config }
    }

    /// Computes the assignment that follows `current` given this report's
    /// match outcome. `current` is never modified.
    pub fn advance(
        &self,
        graph: &ScheduleGraph,
        current: &Assignment,
        outcome: &MatchOutcome,
        at: DateTime<Utc>,
    ) -> Assignment {
        let next = match current.state {
            AssignmentState::Lost => self.from_lost(current, at),
            AssignmentState::Unassigned => self.from_unassigned(current, outcome, at),
            AssignmentState::Assigned | AssignmentState::AssignedLayover => {
                self.from_assigned(graph, current, outcome, at)
            }
        };

        if next.state != current.state || next.trip_id != current.trip_id {
            info!(
                vehicle_id = %current.vehicle_id,
                from = %current.state,
                to = %next.state,
                trip_id = next.trip_id.as_deref().unwrap_or("-"),
                block_id = next.block_id.as_deref().unwrap_or("-"),
                "Assignment changed"
            );
        }
        next
    }

    /// Drops an assignment whose trip no longer exists in `graph`, as after a
    /// schedule version swap.
    pub fn reconcile(&self, graph: &ScheduleGraph, current: &Assignment, at: DateTime<Utc>) -> Assignment {
        match current.trip_id.as_deref() {
            Some(trip_id) if graph.trip(trip_id).is_none() => {
                info!(
                    vehicle_id = %current.vehicle_id,
                    trip_id,
                    version = graph.version(),
                    "Assigned trip missing from schedule, unassigning"
                );
                Assignment::unassigned(&current.vehicle_id, at)
            }
            _ => current.clone(),
        }
    }

    fn from_lost(&self, current: &Assignment, at: DateTime<Utc>) -> Assignment {
        if at - current.since >= Duration::seconds(self.config.lost_cooldown_secs) {
            Assignment::unassigned(&current.vehicle_id, at)
        } else {
            current.clone()
        }
    }

    fn from_unassigned(&self, current: &Assignment, outcome: &MatchOutcome, at: DateTime<Utc>) -> Assignment {
        match outcome {
            MatchOutcome::Matched(m) if m.confidence >= self.config.high_confidence => {
                current.to_trip(m, AssignmentState::Assigned, at)
            }
            MatchOutcome::Matched(_) => current.clone(),
            MatchOutcome::Ambiguous(tied) => {
                let mut next = current.clone();
                next.ambiguous_reports += 1;
                if next.ambiguous_reports > self.config.ambiguity_retry_budget {
                    let trips: Vec<&str> = tied.iter().map(|m| m.trip_id.as_str()).collect();
                    warn!(
                        vehicle_id = %current.vehicle_id,
                        attempts = next.ambiguous_reports,
                        trips = ?trips,
                        "Assignment still ambiguous after retry budget"
                    );
                    return next.lost(at);
                }
                next
            }
            MatchOutcome::Unmatched(_) => {
                let mut next = current.clone();
                next.unmatched_reports = next.unmatched_reports.saturating_add(1);
                next
            }
        }
    }

    fn from_assigned(
        &self,
        graph: &ScheduleGraph,
        current: &Assignment,
        outcome: &MatchOutcome,
        at: DateTime<Utc>,
    ) -> Assignment {
        let Some(m) = outcome.best() else {
            let mut next = current.clone();
            next.unmatched_reports += 1;
            if next.unmatched_reports > self.config.allowable_unmatched_reports {
                return next.lost(at);
            }
            return next;
        };

        let on_block = current.block_id.as_deref() == Some(m.block_id.as_str())
            && current.service_date == Some(m.service_date);
        if !on_block {
            let mut next = current.clone();
            next.unmatched_reports = 0;
            let started = *next.off_block_since.get_or_insert(at);
            if at - started >= Duration::seconds(self.config.off_block_lost_secs) {
                warn!(
                    vehicle_id = %current.vehicle_id,
                    block_id = current.block_id.as_deref().unwrap_or("-"),
                    matched_block = %m.block_id,
                    "Vehicle running off its block"
                );
                return next.lost(at);
            }
            return next;
        }

        let assigned_trip = current.trip_id.as_deref() == Some(m.trip_id.as_str());
        let mut next = if current.is_layover() {
            if assigned_trip {
                current.to_trip(m, AssignmentState::Assigned, at)
            } else {
                // Still finishing the previous trip.
                let mut next = current.clone();
                next.unmatched_reports = 0;
                next.off_block_since = None;
                return next;
            }
        } else if assigned_trip {
            let mut next = current.clone();
            next.unmatched_reports = 0;
            next.ambiguous_reports = 0;
            next.off_block_since = None;
            next
        } else {
            current.to_trip(m, AssignmentState::Assigned, at)
        };

        if let Some(layover) = self.layover_for(graph, m, at) {
            next = layover;
            next.vehicle_id = current.vehicle_id.clone();
        }
        next
    }

    /// Moves the trip pointer forward when `m` is at the end of its trip and
    /// the block's next trip starts within the layover window.
    fn layover_for(&self, graph: &ScheduleGraph, m: &Match, at: DateTime<Utc>) -> Option<Assignment> {
        let trip = graph.trip(&m.trip_id)?;
        let pattern = graph.pattern_for(trip)?;
        if m.stop_path_index + 1 < pattern.stop_paths.len()
            || m.remaining_m > self.config.trip_end_tolerance_m
        {
            return None;
        }

        let next = graph.next_trip_in_block(&trip.id, m.service_date)?;
        let next_start = graph.scheduled_instant(m.service_date, next.start_secs())?;
        if next_start - at > Duration::seconds(self.config.layover_window_secs) {
            return None;
        }

        Some(Assignment {
            vehicle_id: m.vehicle_id.clone(),
            block_id: Some(next.block_id.clone()),
            trip_id: Some(next.id.clone()),
            service_date: Some(m.service_date),
            state: AssignmentState::AssignedLayover,
            since: at,
            unmatched_reports: 0,
            ambiguous_reports: 0,
            off_block_since: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::UnmatchedReason;
    use crate::schedule::fixtures;

    fn matched(trip_id: &str, block_id: &str, idx: usize, remaining_m: f64, confidence: f64) -> Match {
        Match {
            vehicle_id: "V1".into(),
            trip_id: trip_id.into(),
            block_id: block_id.into(),
            route_id: "R1".into(),
            service_date: fixtures::service_date(),
            stop_path_index: idx,
            stop_id: "B".into(),
            stop_sequence: idx as u32 + 1,
            distance_along_segment: 1000.0 - remaining_m,
            remaining_m,
            perpendicular_m: 5.0,
            confidence,
            matched_at: fixtures::at(8, 0, 0),
        }
    }

    fn unmatched() -> MatchOutcome {
        MatchOutcome::Unmatched(UnmatchedReason::OffRoute)
    }

    fn assigner() -> BlockAssigner {
        BlockAssigner::new(AssignmentConfig::default())
    }

    fn assigned_t1() -> Assignment {
        let graph = fixtures::graph();
        let start = Assignment::unassigned("V1", fixtures::at(8, 0, 0));
        assigner().advance(
            &graph,
            &start,
            &MatchOutcome::Matched(matched("T1", "B1", 1, 980.0, 0.9)),
            fixtures::at(8, 0, 0),
        )
    }

    #[test]
    fn test_confident_match_assigns() {
        let a = assigned_t1();
        assert_eq!(a.state, AssignmentState::Assigned);
        assert_eq!(a.trip_id.as_deref(), Some("T1"));
        assert_eq!(a.block_id.as_deref(), Some("B1"));
        assert_eq!(a.current_trip(), Some(("T1", fixtures::service_date())));
    }

    #[test]
    fn test_weak_match_does_not_assign() {
        let graph = fixtures::graph();
        let start = Assignment::unassigned("V1", fixtures::at(8, 0, 0));
        let a = assigner().advance(
            &graph,
            &start,
            &MatchOutcome::Matched(matched("T1", "B1", 1, 980.0, 0.4)),
            fixtures::at(8, 0, 0),
        );
        assert_eq!(a.state, AssignmentState::Unassigned);
    }

    #[test]
    fn test_lost_after_tolerated_unmatched_reports() {
        let graph = fixtures::graph();
        let mut a = assigned_t1();
        for i in 1..=3 {
            a = assigner().advance(&graph, &a, &unmatched(), fixtures::at(8, i, 0));
            assert_eq!(a.state, AssignmentState::Assigned);
            assert_eq!(a.unmatched_reports, i);
        }
        a = assigner().advance(&graph, &a, &unmatched(), fixtures::at(8, 4, 0));
        assert_eq!(a.state, AssignmentState::Lost);
        assert_eq!(a.trip_id, None);
        assert_eq!(a.current_trip(), None);
    }

    #[test]
    fn test_lost_cools_down_without_reassigning() {
        let graph = fixtures::graph();
        let mut a = assigned_t1();
        for i in 1..=4 {
            a = assigner().advance(&graph, &a, &unmatched(), fixtures::at(8, i, 0));
        }
        assert_eq!(a.state, AssignmentState::Lost);

        let good = MatchOutcome::Matched(matched("T1", "B1", 2, 500.0, 0.95));
        let still = assigner().advance(&graph, &a, &good, fixtures::at(8, 5, 0));
        assert_eq!(still.state, AssignmentState::Lost);

        let cooled = assigner().advance(&graph, &still, &good, fixtures::at(8, 6, 0));
        assert_eq!(cooled.state, AssignmentState::Unassigned);

        let again = assigner().advance(&graph, &cooled, &good, fixtures::at(8, 6, 10));
        assert_eq!(again.state, AssignmentState::Assigned);
    }

    #[test]
    fn test_layover_then_next_trip() {
        let graph = fixtures::graph();
        let a = assigned_t1();

        let at_end = MatchOutcome::Matched(matched("T1", "B1", 3, 10.0, 0.9));
        let layover = assigner().advance(&graph, &a, &at_end, fixtures::at(8, 9, 0));
        assert_eq!(layover.state, AssignmentState::AssignedLayover);
        assert_eq!(layover.trip_id.as_deref(), Some("T2"));

        // Sitting at the terminal still matches the end of T1.
        let waiting = assigner().advance(&graph, &layover, &at_end, fixtures::at(8, 12, 0));
        assert_eq!(waiting.state, AssignmentState::AssignedLayover);

        let departed = MatchOutcome::Matched(matched("T2", "B1", 1, 900.0, 0.9));
        let on_t2 = assigner().advance(&graph, &waiting, &departed, fixtures::at(8, 16, 0));
        assert_eq!(on_t2.state, AssignmentState::Assigned);
        assert_eq!(on_t2.trip_id.as_deref(), Some("T2"));
    }

    #[test]
    fn test_trip_end_without_next_trip_stays_assigned() {
        let graph = fixtures::graph();
        let start = Assignment::unassigned("V1", fixtures::at(9, 0, 0));
        let a = assigner().advance(
            &graph,
            &start,
            &MatchOutcome::Matched(matched("T3", "B2", 1, 900.0, 0.9)),
            fixtures::at(9, 0, 0),
        );
        let end = MatchOutcome::Matched(matched("T3", "B2", 3, 0.0, 0.9));
        let after = assigner().advance(&graph, &a, &end, fixtures::at(9, 9, 0));
        assert_eq!(after.state, AssignmentState::Assigned);
        assert_eq!(after.trip_id.as_deref(), Some("T3"));
    }

    #[test]
    fn test_sustained_off_block_is_lost() {
        let graph = fixtures::graph();
        let a = assigned_t1();
        let elsewhere = MatchOutcome::Matched(matched("T3", "B2", 1, 500.0, 0.9));

        let first = assigner().advance(&graph, &a, &elsewhere, fixtures::at(8, 50, 0));
        assert_eq!(first.state, AssignmentState::Assigned);
        assert_eq!(first.off_block_since, Some(fixtures::at(8, 50, 0)));

        let back = MatchOutcome::Matched(matched("T1", "B1", 2, 500.0, 0.9));
        let recovered = assigner().advance(&graph, &first, &back, fixtures::at(8, 52, 0));
        assert_eq!(recovered.off_block_since, None);

        let second = assigner().advance(&graph, &first, &elsewhere, fixtures::at(8, 55, 0));
        assert_eq!(second.state, AssignmentState::Lost);
    }

    #[test]
    fn test_unresolved_ambiguity_is_lost() {
        let graph = fixtures::graph();
        let tie = MatchOutcome::Ambiguous(vec![
            matched("T1", "B1", 1, 500.0, 0.9),
            matched("T3", "B2", 1, 500.0, 0.9),
        ]);
        let mut a = Assignment::unassigned("V1", fixtures::at(8, 0, 0));
        for i in 1..=3 {
            a = assigner().advance(&graph, &a, &tie, fixtures::at(8, i, 0));
            assert_eq!(a.state, AssignmentState::Unassigned);
        }
        a = assigner().advance(&graph, &a, &tie, fixtures::at(8, 4, 0));
        assert_eq!(a.state, AssignmentState::Lost);
    }

    #[test]
    fn test_reconcile_drops_vanished_trip() {
        let a = assigned_t1();
        let next = fixtures::builder_with_version("v2")
            .trip(fixtures::trip("T3", "P_EAST", "B2", 9 * 3600))
            .build()
            .unwrap();
        let reconciled = assigner().reconcile(&next, &a, fixtures::at(8, 1, 0));
        assert_eq!(reconciled.state, AssignmentState::Unassigned);

        let same = assigner().reconcile(&fixtures::graph(), &a, fixtures::at(8, 1, 0));
        assert_eq!(same, a);
    }
}
