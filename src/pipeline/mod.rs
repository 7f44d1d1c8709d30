//! Ingestion pipeline: reports flow from sources through per-vehicle lanes
//! into the processor, which commits results to the state store.

pub mod lanes;
pub mod maintenance;
pub mod processor;
pub mod traversal;

pub use lanes::{IngestMetrics, Ingestor, Lanes, MetricsSnapshot, spawn_source_worker};
pub use maintenance::{handoff_once, spawn_expiry_task, spawn_schedule_watcher, spawn_stat_handoff};
pub use processor::{CommitGuard, Disposition, Processed, ReportProcessor};
pub use traversal::{ArrivalDeparture, StopEventKind};
