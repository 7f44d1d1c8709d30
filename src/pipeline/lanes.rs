//! Vehicle lanes: per-vehicle serialization without a global lock.
//!
//! Reports are routed to one of N lanes by a hash of the vehicle id, so all
//! reports of a vehicle go through the same lane in arrival order while
//! different vehicles are processed in parallel on other lanes. Each report
//! runs on the blocking pool under a deadline; a report that misses it is
//! dropped and counted, and the lane moves on.

use anyhow::{Result, anyhow};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error, info, warn};

use super::processor::{CommitGuard, Disposition, Processed, ReportProcessor};
use crate::avl::{AvlReport, AvlSource};
use crate::config::IngestConfig;
use crate::error::ReportError;

#[derive(Debug, Default)]
pub struct IngestMetrics {
    received: AtomicU64,
    matched: AtomicU64,
    ambiguous: AtomicU64,
    unmatched: AtomicU64,
    invalid: AtomicU64,
    stale: AtomicU64,
    throttled: AtomicU64,
    deadline: AtomicU64,
    fatal: AtomicU64,
    panicked: AtomicU64,
    observations: AtomicU64,
    stop_events: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub matched: u64,
    pub ambiguous: u64,
    pub unmatched: u64,
    pub invalid: u64,
    pub stale: u64,
    pub throttled: u64,
    pub deadline: u64,
    pub fatal: u64,
    /// Reports whose processing task panicked.
    pub panicked: u64,
    pub observations: u64,
    pub stop_events: u64,
}

impl IngestMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, processed: &Processed) {
        match processed.disposition {
            Disposition::Matched => Self::bump(&self.matched),
            Disposition::Ambiguous => Self::bump(&self.ambiguous),
            Disposition::Unmatched(_) => Self::bump(&self.unmatched),
        }
        self.observations
            .fetch_add(processed.observations as u64, Ordering::Relaxed);
        self.stop_events
            .fetch_add(processed.stop_events as u64, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        Self::bump(&self.panicked);
    }

    pub fn record_error(&self, error: &ReportError) {
        let counter = match error {
            ReportError::InputValidation { .. } => &self.invalid,
            ReportError::StaleReport { .. } => &self.stale,
            ReportError::TooFrequent { .. } => &self.throttled,
            ReportError::DeadlineExceeded { .. } => &self.deadline,
            ReportError::StoreCapacityExceeded { .. } => &self.fatal,
        };
        Self::bump(counter);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let matched = load(&self.matched);
        let ambiguous = load(&self.ambiguous);
        let unmatched = load(&self.unmatched);
        MetricsSnapshot {
            received: load(&self.received),
            accepted: matched + ambiguous + unmatched,
            matched,
            ambiguous,
            unmatched,
            invalid: load(&self.invalid),
            stale: load(&self.stale),
            throttled: load(&self.throttled),
            deadline: load(&self.deadline),
            fatal: load(&self.fatal),
            panicked: load(&self.panicked),
            observations: load(&self.observations),
            stop_events: load(&self.stop_events),
        }
    }
}

/// Entry point for reports. Cheap to clone; the lanes stop once every clone
/// has been dropped and their queues are drained.
#[derive(Clone)]
pub struct Ingestor {
    senders: Vec<mpsc::Sender<AvlReport>>,
    metrics: Arc<IngestMetrics>,
}

/// The lane tasks plus the channel on which they surface fatal errors.
pub struct Lanes {
    handles: Vec<JoinHandle<()>>,
    fatal: mpsc::UnboundedReceiver<ReportError>,
}

impl Ingestor {
    pub fn start(processor: Arc<ReportProcessor>, config: &IngestConfig) -> (Self, Lanes) {
        let metrics = Arc::new(IngestMetrics::default());
        let (fatal_tx, fatal) = mpsc::unbounded_channel();
        let deadline = config.report_deadline();

        let lane_count = config.lanes.max(1);
        let mut senders = Vec::with_capacity(lane_count);
        let mut handles = Vec::with_capacity(lane_count);

        for lane in 0..lane_count {
            let (tx, rx) = mpsc::channel(config.lane_capacity.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(
                run_lane(
                    rx,
                    Arc::clone(&processor),
                    Arc::clone(&metrics),
                    fatal_tx.clone(),
                    deadline,
                )
                .instrument(tracing::info_span!("lane", lane)),
            ));
        }
        info!(lanes = lane_count, deadline_ms = deadline.as_millis() as u64, "Ingestion lanes started");

        (Self { senders, metrics }, Lanes { handles, fatal })
    }

    pub fn lane_for(&self, vehicle_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        vehicle_id.trim().hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queues a report on its vehicle's lane, waiting if the lane is full.
    pub async fn submit(&self, report: AvlReport) -> Result<()> {
        let lane = self.lane_for(&report.vehicle_id);
        self.senders[lane]
            .send(report)
            .await
            .map_err(|_| anyhow!("lane {lane} is closed"))
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl Lanes {
    /// Resolves with the first fatal error any lane reports.
    pub async fn fatal(&mut self) -> Option<ReportError> {
        self.fatal.recv().await
    }

    /// Waits until every lane has drained its queue and exited.
    pub async fn drain(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Lane task failed");
            }
        }
        info!("Ingestion lanes drained");
    }
}

async fn run_lane(
    mut rx: mpsc::Receiver<AvlReport>,
    processor: Arc<ReportProcessor>,
    metrics: Arc<IngestMetrics>,
    fatal: mpsc::UnboundedSender<ReportError>,
    deadline: Duration,
) {
    while let Some(report) = rx.recv().await {
        metrics.received.fetch_add(1, Ordering::Relaxed);
        let vehicle_id = report.vehicle_id.clone();
        let guard = Arc::new(CommitGuard::new());

        let mut task = {
            let processor = Arc::clone(&processor);
            let guard = Arc::clone(&guard);
            tokio::task::spawn_blocking(move || processor.process(report, &guard))
        };

        let joined = match tokio::time::timeout(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) if guard.abandon() => {
                warn!(vehicle_id = %vehicle_id, deadline_ms = deadline.as_millis() as u64, "Report dropped after deadline");
                metrics.record_error(&ReportError::DeadlineExceeded {
                    vehicle_id,
                    deadline,
                });
                continue;
            }
            // Already committing; the write must land before the next report.
            Err(_) => task.await,
        };

        settle(joined, &vehicle_id, &metrics, &fatal);
    }
}

fn settle(
    joined: std::result::Result<std::result::Result<Processed, ReportError>, JoinError>,
    vehicle_id: &str,
    metrics: &IngestMetrics,
    fatal: &mpsc::UnboundedSender<ReportError>,
) {
    match joined {
        Ok(Ok(processed)) => metrics.record_processed(&processed),
        Ok(Err(e)) if e.is_fatal() => {
            error!(vehicle_id = %vehicle_id, error = %e, "Fatal ingestion error");
            metrics.record_error(&e);
            let _ = fatal.send(e);
        }
        Ok(Err(ReportError::DeadlineExceeded { .. })) => {
            // Counted when the lane abandoned it.
        }
        Ok(Err(e)) => {
            match e {
                ReportError::InputValidation { .. } => warn!(error = %e, "Invalid report dropped"),
                _ => debug!(error = %e, "Report dropped"),
            }
            metrics.record_error(&e);
        }
        Err(e) => {
            error!(vehicle_id = %vehicle_id, error = %e, "Report processing panicked");
            metrics.record_panic();
        }
    }
}

/// Polls `source` every `interval` and feeds its reports into the lanes
/// until shutdown is signalled or the source is exhausted.
pub fn spawn_source_worker(
    mut source: Box<dyn AvlSource>,
    ingestor: Ingestor,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let span = tracing::info_span!("source", name = %source.name());
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                match source.next_batch().await {
                    Ok(Some(batch)) => {
                        debug!(reports = batch.len(), "Submitting batch");
                        for report in batch {
                            if let Err(e) = ingestor.submit(report).await {
                                error!(error = %e, "Cannot submit report");
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        info!("Source exhausted");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Source poll failed"),
                }
            }
            info!("Source worker stopped");
        }
        .instrument(span),
    )
}
