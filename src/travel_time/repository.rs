//! Durable storage for travel-time buckets.
//!
//! The model is seeded from a repository at startup and hands its snapshot
//! back periodically. Both adapters store the same CSV layout, one row per
//! [`TravelTimeStat`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};

use super::model::TravelTimeStat;

#[async_trait]
pub trait TravelTimeRepository: Send + Sync {
    /// All persisted buckets; empty when nothing has been stored yet.
    async fn load(&self) -> Result<Vec<TravelTimeStat>>;

    async fn store(&self, stats: &[TravelTimeStat]) -> Result<()>;
}

pub fn encode_csv(stats: &[TravelTimeStat]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for stat in stats {
        writer.serialize(stat)?;
    }
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flushing travel-time CSV: {}", e.error()))
}

pub fn decode_csv(bytes: &[u8]) -> Result<Vec<TravelTimeStat>> {
    let mut reader = csv::Reader::from_reader(bytes);
    let stats = reader
        .deserialize::<TravelTimeStat>()
        .collect::<Result<Vec<_>, _>>()?;
    Ok(stats)
}

/// Plain CSV file. Writes go to a sibling temp file first and are renamed
/// into place so a crash never leaves a truncated file behind.
pub struct CsvStatRepository {
    path: String,
}

impl CsvStatRepository {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TravelTimeRepository for CsvStatRepository {
    async fn load(&self) -> Result<Vec<TravelTimeStat>> {
        if !Path::new(&self.path).exists() {
            info!(path = %self.path, "No travel-time history yet");
            return Ok(Vec::new());
        }
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading travel times '{}'", self.path))?;
        let stats = decode_csv(&bytes).with_context(|| format!("parsing '{}'", self.path))?;
        info!(path = %self.path, buckets = stats.len(), "Travel-time history loaded");
        Ok(stats)
    }

    #[tracing::instrument(skip(self, stats), fields(path = %self.path, buckets = stats.len()))]
    async fn store(&self, stats: &[TravelTimeStat]) -> Result<()> {
        let bytes = encode_csv(stats)?;
        write_atomic(&self.path, &bytes).await?;
        debug!("Travel-time history written");
        Ok(())
    }
}

/// Gzip-compressed CSV object in S3.
pub struct S3StatArchive {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
}

impl S3StatArchive {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl TravelTimeRepository for S3StatArchive {
    #[tracing::instrument(skip(self), fields(bucket = %self.bucket, key = %self.key))]
    async fn load(&self) -> Result<Vec<TravelTimeStat>> {
        let object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                info!("No travel-time archive yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let compressed = object.body.collect().await?.into_bytes();
        let mut csv_bytes = Vec::new();
        GzDecoder::new(compressed.as_ref()).read_to_end(&mut csv_bytes)?;
        let stats = decode_csv(&csv_bytes)?;
        info!(buckets = stats.len(), "Travel-time archive loaded");
        Ok(stats)
    }

    #[tracing::instrument(skip(self, stats), fields(bucket = %self.bucket, key = %self.key, buckets = stats.len()))]
    async fn store(&self, stats: &[TravelTimeStat]) -> Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&encode_csv(stats)?)?;
        let body = encoder.finish()?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_encoding("gzip")
            .body(ByteStream::from(body))
            .send()
            .await?;
        debug!("Travel-time archive uploaded");
        Ok(())
    }
}

/// Writes `bytes` to `path` via a temp file and rename.
pub async fn write_atomic(path: &str, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = format!("{path}.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing '{tmp}'"))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming '{tmp}' to '{path}'"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::DayType;
    use std::env;
    use std::fs;

    fn stats() -> Vec<TravelTimeStat> {
        vec![
            TravelTimeStat {
                segment_id: "A-B".into(),
                time_of_day_bucket: 8,
                day_type: DayType::Weekday,
                sample_count: 12,
                mean_traversal_seconds: 181.5,
                variance: 42.25,
            },
            TravelTimeStat {
                segment_id: "B-C".into(),
                time_of_day_bucket: 17,
                day_type: DayType::SundayHoliday,
                sample_count: 1,
                mean_traversal_seconds: 95.0,
                variance: 0.0,
            },
        ]
    }

    #[test]
    fn test_csv_layout() {
        let bytes = encode_csv(&stats()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "segment_id,time_of_day_bucket,day_type,sample_count,mean_traversal_seconds,variance"
        );
        assert_eq!(lines.next().unwrap(), "A-B,8,weekday,12,181.5,42.25");
        assert_eq!(decode_csv(text.as_bytes()).unwrap(), stats());
    }

    #[tokio::test]
    async fn test_file_repository_store_then_load() {
        let path = format!("{}/transit_tracker_stats_test.csv", env::temp_dir().display());
        let _ = fs::remove_file(&path);
        let repo = CsvStatRepository::new(path.clone());

        assert!(repo.load().await.unwrap().is_empty());
        repo.store(&stats()).await.unwrap();
        assert_eq!(repo.load().await.unwrap(), stats());
        assert!(!Path::new(&format!("{path}.tmp")).exists());

        fs::remove_file(&path).unwrap();
    }
}
