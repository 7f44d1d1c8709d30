//! Adapters from upstream transports to [`AvlReport`]s.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

use super::report::AvlReport;
use crate::fetch::{HttpClient, fetch_bytes};
use crate::gtfs_rt::FeedMessage;
use crate::parser::parse_feed;

const DEFAULT_RETENTION_SECS: i64 = 900;

/// A pull-based source of location reports, driven by one ingestion worker.
#[async_trait]
pub trait AvlSource: Send {
    fn name(&self) -> &str;

    /// Reports that arrived since the previous call. `Ok(None)` means the
    /// source is exhausted and its worker should stop.
    async fn next_batch(&mut self) -> Result<Option<Vec<AvlReport>>>;
}

/// Polls a GTFS-realtime VehiclePositions feed. Positions whose timestamp
/// has not advanced since the last poll are filtered out here, so repeated
/// snapshots of an unchanged feed do not show up as stale reports.
///
/// A vehicle is forgotten once its last position is `retention` older than
/// the newest position of a poll, which keeps the map bounded by the fleet
/// that is actually reporting.
pub struct GtfsRtAvlSource<C> {
    name: String,
    client: C,
    url: String,
    last_seen: HashMap<String, DateTime<Utc>>,
    retention: Duration,
}

impl<C: HttpClient> GtfsRtAvlSource<C> {
    pub fn new(name: impl Into<String>, client: C, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client,
            url: url.into(),
            last_seen: HashMap::new(),
            retention: Duration::seconds(DEFAULT_RETENTION_SECS),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn fresh(&mut self, reports: Vec<AvlReport>) -> Vec<AvlReport> {
        let newest = reports.iter().map(|r| r.timestamp).max();
        let fresh: Vec<AvlReport> = reports
            .into_iter()
            .filter(|r| {
                let newer = self
                    .last_seen
                    .get(&r.vehicle_id)
                    .is_none_or(|seen| r.timestamp > *seen);
                if newer {
                    self.last_seen.insert(r.vehicle_id.clone(), r.timestamp);
                }
                newer
            })
            .collect();

        if let Some(newest) = newest {
            let cutoff = newest - self.retention;
            let before = self.last_seen.len();
            self.last_seen.retain(|_, seen| *seen >= cutoff);
            let evicted = before - self.last_seen.len();
            if evicted > 0 {
                debug!(evicted, "Forgot silent vehicles");
            }
        }
        fresh
    }
}

#[async_trait]
impl<C: HttpClient> AvlSource for GtfsRtAvlSource<C> {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self), fields(source = %self.name))]
    async fn next_batch(&mut self) -> Result<Option<Vec<AvlReport>>> {
        let bytes = fetch_bytes(&self.client, &self.url).await?;
        let feed = parse_feed(&bytes)?;
        let reports = vehicle_reports(&feed, &self.name);
        let total = reports.len();
        let fresh = self.fresh(reports);
        debug!(total, fresh = fresh.len(), "Polled vehicle positions");
        Ok(Some(fresh))
    }
}

/// Extracts one report per VehiclePosition entity that carries a position
/// and a timestamp (its own, or the feed header's).
pub fn vehicle_reports(feed: &FeedMessage, source: &str) -> Vec<AvlReport> {
    let header_ts = feed.header.timestamp;

    feed.entity
        .iter()
        .filter_map(|entity| {
            let vp = entity.vehicle.as_ref()?;
            let position = vp.position.as_ref()?;
            let ts = vp.timestamp.or(header_ts)?;
            let timestamp = DateTime::<Utc>::from_timestamp(i64::try_from(ts).ok()?, 0)?;
            let vehicle_id = vp
                .vehicle
                .as_ref()
                .and_then(|v| v.id.clone())
                .unwrap_or_else(|| entity.id.clone());

            Some(AvlReport {
                vehicle_id,
                timestamp,
                latitude: position.latitude as f64,
                longitude: position.longitude as f64,
                heading: position.bearing.map(f64::from),
                speed: position.speed.map(f64::from),
                source: source.to_string(),
            })
        })
        .collect()
}

/// Replays a CSV file with columns
/// `vehicle_id,timestamp,latitude,longitude,heading,speed`, where `timestamp`
/// is RFC 3339. The whole file is returned in timestamp order on the first
/// call.
pub struct CsvAvlSource {
    name: String,
    path: String,
    done: bool,
}

impl CsvAvlSource {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: format!("csv:{path}"),
            path,
            done: false,
        }
    }
}

#[async_trait]
impl AvlSource for CsvAvlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<AvlReport>>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let mut reports = read_reports(&self.path)?;
        for r in &mut reports {
            if r.source.is_empty() {
                r.source = self.name.clone();
            }
        }
        info!(path = %self.path, reports = reports.len(), "Loaded replay reports");
        Ok(Some(reports))
    }
}

/// Reads AVL reports from a CSV file, stably sorted by timestamp.
pub fn read_reports(path: &str) -> Result<Vec<AvlReport>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening AVL replay '{path}'"))?;
    let mut reports = reader
        .deserialize::<AvlReport>()
        .enumerate()
        .map(|(i, row)| row.with_context(|| format!("{path}: bad record {}", i + 1)))
        .collect::<Result<Vec<_>>>()?;
    reports.sort_by_key(|r| r.timestamp);
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{
        FeedEntity, FeedHeader, Position, VehicleDescriptor, VehiclePosition,
    };
    use std::env;
    use std::fs;

    fn entity(id: &str, vehicle_id: Option<&str>, ts: Option<u64>) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            vehicle: Some(VehiclePosition {
                vehicle: vehicle_id.map(|v| VehicleDescriptor {
                    id: Some(v.to_string()),
                    ..Default::default()
                }),
                position: Some(Position {
                    latitude: 45.0,
                    longitude: -122.7,
                    bearing: Some(90.0),
                    speed: Some(8.0),
                    ..Default::default()
                }),
                timestamp: ts,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn feed(entities: Vec<FeedEntity>, header_ts: Option<u64>) -> FeedMessage {
        FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".into(),
                timestamp: header_ts,
                ..Default::default()
            },
            entity: entities,
        }
    }

    #[test]
    fn test_vehicle_reports_from_feed() {
        let feed = feed(
            vec![
                entity("e1", Some("bus-1"), Some(1_772_438_400)),
                entity("e2", None, None),
                FeedEntity {
                    id: "alert".into(),
                    ..Default::default()
                },
            ],
            Some(1_772_438_460),
        );

        let reports = vehicle_reports(&feed, "rt");
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].vehicle_id, "bus-1");
        assert_eq!(reports[0].timestamp.timestamp(), 1_772_438_400);
        assert_eq!(reports[0].heading, Some(90.0));
        assert_eq!(reports[1].vehicle_id, "e2");
        assert_eq!(reports[1].timestamp.timestamp(), 1_772_438_460);
    }

    #[test]
    fn test_missing_timestamp_skipped() {
        let feed = feed(vec![entity("e1", Some("bus-1"), None)], None);
        assert!(vehicle_reports(&feed, "rt").is_empty());
    }

    #[test]
    fn test_poller_drops_unchanged_positions() {
        let mut source = GtfsRtAvlSource::new("rt", crate::fetch::BasicClient::new(), "http://x");
        let first = vehicle_reports(&feed(vec![entity("e1", Some("bus-1"), Some(100))], None), "rt");
        assert_eq!(source.fresh(first.clone()).len(), 1);
        assert!(source.fresh(first).is_empty());

        let later = vehicle_reports(&feed(vec![entity("e1", Some("bus-1"), Some(130))], None), "rt");
        assert_eq!(source.fresh(later).len(), 1);
    }

    #[test]
    fn test_poller_forgets_silent_vehicles() {
        let mut source = GtfsRtAvlSource::new("rt", crate::fetch::BasicClient::new(), "http://x")
            .with_retention(Duration::seconds(300));
        let both = vehicle_reports(
            &feed(
                vec![entity("e1", Some("bus-1"), Some(1_000)), entity("e2", Some("bus-2"), Some(1_000))],
                None,
            ),
            "rt",
        );
        assert_eq!(source.fresh(both).len(), 2);

        // bus-2 keeps reporting its old position; bus-1 moves on.
        let later = vehicle_reports(
            &feed(
                vec![entity("e1", Some("bus-1"), Some(1_400)), entity("e2", Some("bus-2"), Some(1_000))],
                None,
            ),
            "rt",
        );
        assert_eq!(source.fresh(later).len(), 1);
        assert_eq!(source.last_seen.len(), 1);
        assert!(source.last_seen.contains_key("bus-1"));

        // An empty poll evicts nothing.
        assert!(source.fresh(Vec::new()).is_empty());
        assert_eq!(source.last_seen.len(), 1);
    }

    #[tokio::test]
    async fn test_csv_source_replays_sorted_once() {
        let path = format!("{}/transit_tracker_avl_test.csv", env::temp_dir().display());
        fs::write(
            &path,
            "vehicle_id,timestamp,latitude,longitude,heading,speed\n\
             bus-1,2026-03-02T08:01:00Z,45.0,-122.69,,\n\
             bus-1,2026-03-02T08:00:00Z,45.0,-122.70,90,8.5\n",
        )
        .unwrap();

        let mut source = CsvAvlSource::new(path.clone());
        let batch = source.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].longitude, -122.70);
        assert_eq!(batch[0].speed, Some(8.5));
        assert_eq!(batch[1].heading, None);
        assert_eq!(batch[1].source, format!("csv:{path}"));
        assert!(source.next_batch().await.unwrap().is_none());

        fs::remove_file(&path).unwrap();
    }
}
