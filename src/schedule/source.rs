//! JSON schedule documents.
//!
//! Schedule import is owned by an external collaborator; this adapter accepts
//! its already-resolved output (patterns with shapes, trips with stop times)
//! and turns it into a [`ScheduleGraph`]. A pattern stop without a shape gets
//! a straight line from the previous stop.

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Weekday};
use chrono_tz::Tz;
use geo::Coord;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::info;

use super::calendar::Service;
use super::graph::{Route, ScheduleGraph, ScheduleTime, Stop, StopPath, Trip, TripPattern};
use crate::error::ScheduleError;

#[derive(Debug, Deserialize)]
pub struct ScheduleDocument {
    pub version: String,
    pub timezone: String,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
    pub routes: Vec<RouteRecord>,
    pub stops: Vec<StopRecord>,
    pub services: Vec<ServiceRecord>,
    pub patterns: Vec<PatternRecord>,
    pub trips: Vec<TripRecord>,
}

#[derive(Debug, Deserialize)]
pub struct RouteRecord {
    pub id: String,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    /// Weekday names, e.g. `["mon", "tue"]`.
    pub days: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub added: Vec<NaiveDate>,
    #[serde(default)]
    pub removed: Vec<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct PatternRecord {
    pub id: String,
    pub route_id: String,
    pub stops: Vec<PatternStopRecord>,
}

#[derive(Debug, Deserialize)]
pub struct PatternStopRecord {
    pub stop_id: String,
    pub stop_sequence: Option<u32>,
    pub segment_id: Option<String>,
    /// `[lat, lon]` points from the previous stop to this one.
    #[serde(default)]
    pub shape: Vec<[f64; 2]>,
}

#[derive(Debug, Deserialize)]
pub struct TripRecord {
    pub id: String,
    pub route_id: String,
    pub pattern_id: String,
    pub block_id: String,
    pub service_id: String,
    pub direction_id: Option<u32>,
    pub headsign: Option<String>,
    pub stop_times: Vec<StopTimeRecord>,
}

#[derive(Debug, Deserialize)]
pub struct StopTimeRecord {
    pub arrival: String,
    pub departure: Option<String>,
}

impl ScheduleDocument {
    pub fn into_graph(self) -> Result<ScheduleGraph> {
        let timezone: Tz = self
            .timezone
            .parse()
            .map_err(|_| ScheduleError::Timezone(self.timezone.clone()))?;

        let stops: HashMap<&str, Coord<f64>> = self
            .stops
            .iter()
            .map(|s| (s.id.as_str(), Coord { x: s.lon, y: s.lat }))
            .collect();

        let mut builder = ScheduleGraph::builder(self.version.clone(), timezone);

        for date in &self.holidays {
            builder = builder.holiday(*date);
        }
        for route in &self.routes {
            builder = builder.route(Route {
                id: route.id.clone(),
                short_name: route.short_name.clone(),
                long_name: route.long_name.clone(),
            });
        }
        for stop in &self.stops {
            builder = builder.stop(Stop {
                id: stop.id.clone(),
                name: stop.name.clone(),
                location: Coord { x: stop.lon, y: stop.lat },
            });
        }
        for service in &self.services {
            builder = builder.service(service_from_record(service)?);
        }
        for pattern in &self.patterns {
            builder = builder.pattern(pattern_from_record(pattern, &stops)?);
        }
        for trip in &self.trips {
            builder = builder.trip(trip_from_record(trip)?);
        }

        Ok(builder.build()?)
    }
}

/// Reads and builds a schedule graph from a JSON document on disk.
#[tracing::instrument]
pub fn load_schedule_file(path: &str) -> Result<ScheduleGraph> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading schedule '{path}'"))?;
    let document: ScheduleDocument =
        serde_json::from_str(&content).with_context(|| format!("parsing schedule '{path}'"))?;
    let graph = document.into_graph()?;
    info!(version = graph.version(), trips = graph.trips().count(), "Schedule loaded");
    Ok(graph)
}

fn service_from_record(record: &ServiceRecord) -> Result<Service> {
    let mut weekdays = [false; 7];
    for day in &record.days {
        let weekday: Weekday = day
            .parse()
            .map_err(|_| anyhow!("service {}: unknown weekday '{day}'", record.id))?;
        weekdays[weekday.num_days_from_monday() as usize] = true;
    }
    Ok(Service {
        id: record.id.clone(),
        weekdays,
        start_date: record.start_date,
        end_date: record.end_date,
        added_dates: record.added.iter().copied().collect::<HashSet<_>>(),
        removed_dates: record.removed.iter().copied().collect::<HashSet<_>>(),
    })
}

fn pattern_from_record(
    record: &PatternRecord,
    stops: &HashMap<&str, Coord<f64>>,
) -> Result<TripPattern> {
    let mut stop_paths = Vec::with_capacity(record.stops.len());
    let mut previous: Option<Coord<f64>> = None;

    for (i, ps) in record.stops.iter().enumerate() {
        let location = *stops.get(ps.stop_id.as_str()).ok_or_else(|| {
            ScheduleError::UnknownReference {
                kind: "stop",
                id: ps.stop_id.clone(),
                referenced_by: record.id.clone(),
            }
        })?;

        let points = if !ps.shape.is_empty() {
            ps.shape.iter().map(|[lat, lon]| Coord { x: *lon, y: *lat }).collect()
        } else {
            match previous {
                Some(prev) => vec![prev, location],
                None => vec![location],
            }
        };

        let segment_id = ps
            .segment_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", record.id, i));
        let stop_sequence = ps.stop_sequence.unwrap_or(i as u32 + 1);

        stop_paths.push(StopPath::new(segment_id, ps.stop_id.clone(), stop_sequence, points)?);
        previous = Some(location);
    }

    Ok(TripPattern {
        id: record.id.clone(),
        route_id: record.route_id.clone(),
        stop_paths,
    })
}

fn trip_from_record(record: &TripRecord) -> Result<Trip> {
    let schedule = record
        .stop_times
        .iter()
        .map(|st| {
            let arrival_secs = parse_time(&st.arrival)
                .with_context(|| format!("trip {}: bad arrival '{}'", record.id, st.arrival))?;
            let departure_secs = match &st.departure {
                Some(d) => parse_time(d)
                    .with_context(|| format!("trip {}: bad departure '{d}'", record.id))?,
                None => arrival_secs,
            };
            Ok(ScheduleTime {
                arrival_secs,
                departure_secs,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Trip {
        id: record.id.clone(),
        route_id: record.route_id.clone(),
        block_id: record.block_id.clone(),
        service_id: record.service_id.clone(),
        pattern_id: record.pattern_id.clone(),
        direction_id: record.direction_id,
        headsign: record.headsign.clone(),
        schedule,
    })
}

/// Parses `H:MM:SS`, allowing hours past 24 for trips that cross midnight.
pub fn parse_time(s: &str) -> Result<i64> {
    let mut parts = s.trim().split(':');
    let (Some(h), Some(m), Some(sec), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(anyhow!("expected H:MM:SS"));
    };
    let h: i64 = h.parse()?;
    let m: i64 = m.parse()?;
    let sec: i64 = sec.parse()?;
    if !(0..60).contains(&m) || !(0..60).contains(&sec) || h < 0 {
        return Err(anyhow!("time component out of range"));
    }
    Ok(h * 3600 + m * 60 + sec)
}
