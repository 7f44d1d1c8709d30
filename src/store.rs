//! In-memory vehicle state store.
//!
//! Each vehicle's state is an immutable [`VehicleState`] behind an `Arc`.
//! Writers replace the whole `Arc` in one map operation, so a concurrent
//! [`VehicleStateStore::snapshot`] sees either the old or the new state of a
//! vehicle and never a mix. Nothing outside the store mutates a state.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

use crate::assignment::{Assignment, AssignmentState};
use crate::avl::AvlReport;
use crate::error::ReportError;
use crate::matching::{Match, UnmatchedReason};
use crate::pipeline::ArrivalDeparture;
use crate::prediction::Prediction;

/// Last known position on a trip, used to detect completed stop paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Traversal {
    pub trip_id: String,
    pub service_date: NaiveDate,
    pub stop_path_index: usize,
    pub distance_along_m: f64,
    pub at: DateTime<Utc>,
    /// When the vehicle entered the current path, if it was seen doing so.
    pub entered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub arrived_at_terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub vehicle_id: String,
    /// Latest accepted report.
    pub report: AvlReport,
    /// Match for `report`; `None` when it could not be matched.
    pub current_match: Option<Match>,
    pub unmatched_reason: Option<UnmatchedReason>,
    pub assignment: Assignment,
    pub predictions: Vec<Prediction>,
    /// When `predictions` were computed.
    pub predictions_made_at: Option<DateTime<Utc>>,
    pub traversal: Option<Traversal>,
    /// Most recent stop arrivals and departures, oldest first.
    #[serde(default)]
    pub stop_events: Vec<ArrivalDeparture>,
    pub schedule_version: String,
}

impl VehicleState {
    pub fn last_report_at(&self) -> DateTime<Utc> {
        self.report.timestamp
    }

    /// Predictions still servable at `now`. A vehicle tracked on its trip
    /// serves all of them; otherwise they live for `grace_secs` after they
    /// were made.
    pub fn live_predictions(&self, now: DateTime<Utc>, grace_secs: i64) -> &[Prediction] {
        let tracked = self.current_match.is_some()
            && matches!(
                self.assignment.state,
                AssignmentState::Assigned | AssignmentState::AssignedLayover
            );
        let within_grace = self
            .predictions_made_at
            .is_some_and(|at| now - at <= ChronoDuration::seconds(grace_secs));
        if tracked || within_grace {
            &self.predictions
        } else {
            &[]
        }
    }
}

#[derive(Debug)]
pub struct VehicleStateStore {
    entries: DashMap<String, Arc<VehicleState>>,
    count: AtomicUsize,
    capacity: usize,
}

impl VehicleStateStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Atomically replaces the vehicle's entry with `state`.
    ///
    /// Fails only when `state` is for a new vehicle and the store is full.
    pub fn upsert(&self, state: VehicleState) -> Result<(), ReportError> {
        match self.entries.entry(state.vehicle_id.clone()) {
            Entry::Occupied(mut e) => {
                e.insert(Arc::new(state));
            }
            Entry::Vacant(e) => {
                let previous = self.count.fetch_add(1, Ordering::SeqCst);
                if previous >= self.capacity {
                    self.count.fetch_sub(1, Ordering::SeqCst);
                    return Err(ReportError::StoreCapacityExceeded {
                        capacity: self.capacity,
                    });
                }
                e.insert(Arc::new(state));
            }
        }
        Ok(())
    }

    pub fn get(&self, vehicle_id: &str) -> Option<Arc<VehicleState>> {
        self.entries.get(vehicle_id).map(|e| Arc::clone(e.value()))
    }

    /// Point-in-time view of every vehicle. Holding the result does not
    /// block writers.
    pub fn snapshot(&self) -> Vec<Arc<VehicleState>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Removes vehicles whose last report is older than `older_than` and
    /// returns their ids.
    pub fn expire(&self, older_than: DateTime<Utc>) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|id, state| {
            let keep = state.last_report_at() >= older_than;
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        if !removed.is_empty() {
            self.count.fetch_sub(removed.len(), Ordering::SeqCst);
            info!(expired = removed.len(), remaining = self.len(), "Expired silent vehicles");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
