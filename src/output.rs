//! Reporting helpers: log a summary, or append it to a CSV log.
//!
//! Used for per-cycle [`FeedStats`](crate::stats::FeedStats) and for the
//! ingestion metrics written on shutdown.

use anyhow::Result;
use csv::WriterBuilder;
use serde::Serialize;
use std::fmt::Debug;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{debug, info};

/// Logs a summary using the debug pretty-print format.
pub fn print_pretty<T: Debug>(record: &T) {
    debug!("{:#?}", record);
}

/// Logs a summary as pretty-printed JSON.
pub fn print_json<T: Serialize>(record: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

/// Appends `record` as a row to the CSV file at `path`.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record<T: Serialize>(path: &str, record: &T) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "Appending CSV record");

    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    writer.serialize(record)?;
    writer.flush()?;

    Ok(())
}
