//! Periodic background work next to the lanes: silent-vehicle expiry,
//! travel-time stat hand-off and schedule reload.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, warn};

use super::processor::ReportProcessor;
use crate::schedule::load_schedule_file;
use crate::store::VehicleStateStore;
use crate::travel_time::{TravelTimeModel, TravelTimeRepository};

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Removes vehicles silent for longer than `silence_timeout_secs`.
pub fn expire_silent(store: &VehicleStateStore, silence_timeout_secs: i64) -> Vec<String> {
    store.expire(Utc::now() - ChronoDuration::seconds(silence_timeout_secs))
}

pub fn spawn_expiry_task(
    processor: Arc<ReportProcessor>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let store = processor.config().store.clone();
    tokio::spawn(
        async move {
            let mut ticks = ticker(Duration::from_secs(store.expiry_interval_secs));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticks.tick() => {
                        expire_silent(processor.store(), store.silence_timeout_secs);
                    }
                }
            }
        }
        .instrument(tracing::info_span!("expiry")),
    )
}

/// Writes the current travel-time snapshot to `repository`.
#[tracing::instrument(skip_all)]
pub async fn handoff_once(
    model: &TravelTimeModel,
    repository: &dyn TravelTimeRepository,
) -> Result<usize> {
    let stats = model.snapshot();
    repository.store(&stats).await?;
    info!(buckets = stats.len(), "Travel-time stats handed off");
    Ok(stats.len())
}

/// Hands stats off every `period`, and once more on shutdown.
pub fn spawn_stat_handoff(
    model: Arc<TravelTimeModel>,
    repository: Arc<dyn TravelTimeRepository>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = ticker(period);
        // The first tick fires immediately; nothing has been learned yet.
        ticks.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticks.tick() => {
                    if let Err(e) = handoff_once(&model, repository.as_ref()).await {
                        error!(error = %e, "Stat hand-off failed");
                    }
                }
            }
        }
        if let Err(e) = handoff_once(&model, repository.as_ref()).await {
            error!(error = %e, "Final stat hand-off failed");
        }
    })
}

async fn modified_at(path: &str) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Re-reads the schedule file whenever its modification time changes and
/// swaps the new version in. A file that fails to build leaves the current
/// version in place.
pub fn spawn_schedule_watcher(
    processor: Arc<ReportProcessor>,
    path: String,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let span = tracing::info_span!("schedule_watcher", path = %path);
    tokio::spawn(
        async move {
            let mut seen = modified_at(&path).await;
            let mut ticks = ticker(period);
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticks.tick() => {}
                }
                let current = modified_at(&path).await;
                if current.is_none() || current == seen {
                    continue;
                }
                seen = current;
                debug!("Schedule file changed");

                let load_path = path.clone();
                match tokio::task::spawn_blocking(move || load_schedule_file(&load_path)).await {
                    Ok(Ok(graph)) => processor.replace_schedule(graph),
                    Ok(Err(e)) => warn!(error = %e, "Schedule reload failed, keeping current version"),
                    Err(e) => error!(error = %e, "Schedule reload task failed"),
                }
            }
        }
        .instrument(span),
    )
}
