//! Read-only views over the state store for an outward query layer.
//!
//! Predictions go through the same freshness rule as the published feed, so
//! a query never serves predictions the feed has already dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::assignment::AssignmentState;
use crate::pipeline::ArrivalDeparture;
use crate::prediction::Prediction;
use crate::store::{VehicleState, VehicleStateStore};

/// One row of [`TrackingQuery::list_active_vehicles`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleSummary {
    pub vehicle_id: String,
    pub state: AssignmentState,
    pub trip_id: Option<String>,
    pub block_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub last_report_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TrackingQuery {
    store: Arc<VehicleStateStore>,
    grace_secs: i64,
}

impl TrackingQuery {
    pub fn new(store: Arc<VehicleStateStore>, grace_secs: i64) -> Self {
        Self { store, grace_secs }
    }

    /// The vehicle's state as of `now`, without expired predictions.
    pub fn get_vehicle_state(&self, vehicle_id: &str, now: DateTime<Utc>) -> Option<VehicleState> {
        let stored = self.store.get(vehicle_id.trim())?;
        let live = stored.live_predictions(now, self.grace_secs).to_vec();
        let mut state = VehicleState::clone(&stored);
        if live.is_empty() {
            state.predictions_made_at = None;
        }
        state.predictions = live;
        Some(state)
    }

    /// Every vehicle not yet expired, ordered by id.
    pub fn list_active_vehicles(&self) -> Vec<VehicleSummary> {
        let mut vehicles: Vec<VehicleSummary> = self
            .store
            .snapshot()
            .iter()
            .map(|s| VehicleSummary {
                vehicle_id: s.vehicle_id.clone(),
                state: s.assignment.state,
                trip_id: s.assignment.trip_id.clone(),
                block_id: s.assignment.block_id.clone(),
                latitude: s.report.latitude,
                longitude: s.report.longitude,
                last_report_at: s.last_report_at(),
            })
            .collect();
        vehicles.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        vehicles
    }

    /// Live predictions for `stop_id` across all vehicles, soonest first.
    pub fn get_predictions(&self, stop_id: &str, now: DateTime<Utc>) -> Vec<Prediction> {
        let mut predictions: Vec<Prediction> = self
            .store
            .snapshot()
            .iter()
            .flat_map(|s| {
                s.live_predictions(now, self.grace_secs)
                    .iter()
                    .filter(|p| p.stop_id == stop_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        predictions.sort_by(|a, b| {
            a.predicted_arrival
                .cmp(&b.predicted_arrival)
                .then_with(|| a.vehicle_id.cmp(&b.vehicle_id))
        });
        predictions
    }

    /// Recorded arrivals and departures at `stop_id`, in time order.
    pub fn get_stop_events(&self, stop_id: &str) -> Vec<ArrivalDeparture> {
        let mut events: Vec<ArrivalDeparture> = self
            .store
            .snapshot()
            .iter()
            .flat_map(|s| s.stop_events.iter().filter(|e| e.stop_id == stop_id).cloned().collect::<Vec<_>>())
            .collect();
        events.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.vehicle_id.cmp(&b.vehicle_id)));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::fixtures;
    use crate::pipeline::StopEventKind;
    use crate::store::tests::state;
    use chrono::Duration;

    fn prediction(vehicle_id: &str, stop_id: &str, minutes: i64) -> Prediction {
        let arrival = fixtures::at(8, 0, 0) + Duration::minutes(minutes);
        Prediction {
            vehicle_id: vehicle_id.into(),
            trip_id: "T1".into(),
            route_id: "R1".into(),
            service_date: fixtures::service_date(),
            stop_id: stop_id.into(),
            stop_sequence: 2,
            predicted_arrival: arrival,
            predicted_departure: arrival,
            schedule_deviation_seconds: 0,
            confidence: 0.9,
        }
    }

    fn stop_event(vehicle_id: &str, stop_id: &str, kind: StopEventKind, minutes: i64) -> ArrivalDeparture {
        ArrivalDeparture {
            vehicle_id: vehicle_id.into(),
            trip_id: "T1".into(),
            route_id: "R1".into(),
            block_id: "B1".into(),
            service_date: fixtures::service_date(),
            stop_id: stop_id.into(),
            stop_sequence: 2,
            stop_path_index: 1,
            kind,
            time: fixtures::at(8, 0, 0) + Duration::minutes(minutes),
            scheduled: None,
            avl_time: fixtures::at(8, 0, 0) + Duration::minutes(minutes),
        }
    }

    fn query() -> TrackingQuery {
        let store = Arc::new(VehicleStateStore::new(10));
        let mut a = state("V2", fixtures::at(8, 0, 0));
        a.predictions = vec![prediction("V2", "B", 3), prediction("V2", "C", 6)];
        a.predictions_made_at = Some(fixtures::at(8, 0, 0));
        let mut b = state("V1", fixtures::at(8, 0, 0));
        b.predictions = vec![prediction("V1", "B", 1)];
        b.predictions_made_at = Some(fixtures::at(8, 0, 0));
        store.upsert(a).unwrap();
        store.upsert(b).unwrap();
        store.upsert(state("V3", fixtures::at(8, 0, 0))).unwrap();
        TrackingQuery::new(store, 120)
    }

    fn now() -> DateTime<Utc> {
        fixtures::at(8, 0, 30)
    }

    #[test]
    fn test_get_vehicle_state() {
        let q = query();
        let v1 = q.get_vehicle_state(" V1 ", now()).unwrap();
        assert_eq!(v1.vehicle_id, "V1");
        assert_eq!(v1.predictions.len(), 1);
        assert!(q.get_vehicle_state("V9", now()).is_none());
    }

    #[test]
    fn test_list_active_vehicles_sorted() {
        let ids: Vec<_> = query()
            .list_active_vehicles()
            .into_iter()
            .map(|v| v.vehicle_id)
            .collect();
        assert_eq!(ids, vec!["V1", "V2", "V3"]);
    }

    #[test]
    fn test_get_predictions_for_stop_soonest_first() {
        let at_b = query().get_predictions("B", now());
        assert_eq!(at_b.len(), 2);
        assert_eq!(at_b[0].vehicle_id, "V1");
        assert_eq!(at_b[1].vehicle_id, "V2");
        assert!(query().get_predictions("Z", now()).is_empty());
    }

    #[test]
    fn test_stop_events_across_vehicles_in_time_order() {
        let store = Arc::new(VehicleStateStore::new(10));
        let mut a = state("V1", fixtures::at(8, 5, 0));
        a.stop_events = vec![
            stop_event("V1", "B", StopEventKind::Arrival, 4),
            stop_event("V1", "B", StopEventKind::Departure, 4),
            stop_event("V1", "C", StopEventKind::Arrival, 5),
        ];
        let mut b = state("V2", fixtures::at(8, 5, 0));
        b.stop_events = vec![stop_event("V2", "B", StopEventKind::Arrival, 2)];
        store.upsert(a).unwrap();
        store.upsert(b).unwrap();

        let at_b: Vec<_> = TrackingQuery::new(store, 120)
            .get_stop_events("B")
            .into_iter()
            .map(|e| (e.vehicle_id, e.kind))
            .collect();
        assert_eq!(
            at_b,
            vec![
                ("V2".to_string(), StopEventKind::Arrival),
                ("V1".to_string(), StopEventKind::Arrival),
                ("V1".to_string(), StopEventKind::Departure),
            ]
        );
    }

    #[test]
    fn test_lost_vehicle_predictions_expire_like_the_feed() {
        let store = Arc::new(VehicleStateStore::new(10));
        let mut lost = state("V1", fixtures::at(8, 0, 0));
        lost.assignment.state = AssignmentState::Lost;
        lost.predictions = vec![prediction("V1", "B", 12)];
        lost.predictions_made_at = Some(fixtures::at(8, 0, 0));
        store.upsert(lost).unwrap();
        let q = TrackingQuery::new(Arc::clone(&store), 120);

        let later = fixtures::at(8, 10, 0);
        assert!(q.get_predictions("B", later).is_empty());
        let v1 = q.get_vehicle_state("V1", later).unwrap();
        assert!(v1.predictions.is_empty());
        assert!(v1.predictions_made_at.is_none());

        let feed = crate::feed::FeedGenerator::new(25.0, 120).generate(
            &fixtures::graph(),
            &store.snapshot(),
            later,
        );
        assert!(feed.message.entity.iter().all(|e| e.trip_update.is_none()));

        assert_eq!(q.get_predictions("B", fixtures::at(8, 1, 0)).len(), 1);
    }
}
