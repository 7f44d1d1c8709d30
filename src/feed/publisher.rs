//! Periodic feed publication.
//!
//! Each cycle snapshots the store, generates and encodes the feed, and hands
//! the bytes to every configured sink. A failing sink is logged and counted
//! in the cycle's [`FeedStats`]; it never stops the other sinks or the next
//! cycle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::generator::FeedGenerator;
use crate::output::append_record;
use crate::parser::encode_feed;
use crate::schedule::ScheduleHandle;
use crate::stats::FeedStats;
use crate::store::VehicleStateStore;
use crate::travel_time::repository::write_atomic;

#[async_trait]
pub trait FeedSink: Send + Sync {
    fn name(&self) -> &str;

    /// Sinks share one encoded buffer; cloning `Bytes` does not copy it.
    async fn publish(&self, bytes: Bytes) -> Result<()>;
}

/// Writes the feed to a local file, replacing it atomically.
pub struct FileSink {
    path: String,
}

impl FileSink {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedSink for FileSink {
    fn name(&self) -> &str {
        &self.path
    }

    async fn publish(&self, bytes: Bytes) -> Result<()> {
        write_atomic(&self.path, &bytes).await
    }
}

pub struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
    label: String,
}

impl S3Sink {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let key = key.into();
        Self {
            label: format!("s3://{bucket}/{key}"),
            client,
            bucket,
            key,
        }
    }
}

#[async_trait]
impl FeedSink for S3Sink {
    fn name(&self) -> &str {
        &self.label
    }

    async fn publish(&self, bytes: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(ByteStream::from(bytes))
            .content_type("application/x-protobuf")
            .send()
            .await
            .with_context(|| format!("uploading feed to {}", self.label))?;
        Ok(())
    }
}

pub struct FeedPublisher {
    name: String,
    generator: FeedGenerator,
    store: Arc<VehicleStateStore>,
    schedule: Arc<ScheduleHandle>,
    sinks: Vec<Box<dyn FeedSink>>,
    stats_log: Option<String>,
}

impl FeedPublisher {
    pub fn new(
        name: impl Into<String>,
        generator: FeedGenerator,
        store: Arc<VehicleStateStore>,
        schedule: Arc<ScheduleHandle>,
    ) -> Self {
        Self {
            name: name.into(),
            generator,
            store,
            schedule,
            sinks: Vec::new(),
            stats_log: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn FeedSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Appends each cycle's [`FeedStats`] to a CSV file.
    pub fn with_stats_log(mut self, path: impl Into<String>) -> Self {
        self.stats_log = Some(path.into());
        self
    }

    /// Runs one publication cycle.
    #[tracing::instrument(skip(self), fields(feed = %self.name))]
    pub async fn publish_once(&self) -> FeedStats {
        let graph = self.schedule.current();
        let snapshot = self.store.snapshot();
        let generated = self.generator.generate(&graph, &snapshot, Utc::now());
        let bytes = Bytes::from(encode_feed(&generated.message));

        let mut stats = FeedStats::from_feed(&generated.message).with_name(&self.name);
        stats.skipped_records = generated.skipped.len();
        stats.encoded_bytes = bytes.len();

        for sink in &self.sinks {
            match sink.publish(bytes.clone()).await {
                Ok(()) => debug!(sink = sink.name(), bytes = bytes.len(), "Feed written"),
                Err(e) => {
                    error!(sink = sink.name(), error = %e, "Feed sink failed");
                    stats.error_type = Some("sink".to_string());
                    stats.error_message = Some(format!("{}: {e}", sink.name()));
                }
            }
        }

        info!(
            vehicles = stats.vehicles,
            trip_updates = stats.trip_updates,
            skipped = stats.skipped_records,
            bytes = stats.encoded_bytes,
            "Feed published"
        );

        if let Some(path) = &self.stats_log {
            if let Err(e) = append_record(path, &stats) {
                error!(path, error = %e, "Cannot append feed stats");
            }
        }
        stats
    }
}

/// Publishes every `interval` until shutdown. The caller publishes the
/// final feed itself once the lanes have drained.
pub fn spawn_publisher(
    publisher: Arc<FeedPublisher>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticks.tick() => {
                    publisher.publish_once().await;
                }
            }
        }
    })
}
