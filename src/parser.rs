//! Protobuf encoding and decoding of GTFS-realtime feeds.

use anyhow::{Context, Result};
use prost::Message;

use crate::fetch::{HttpClient, fetch_bytes};
use crate::gtfs_rt::FeedMessage;

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    Ok(FeedMessage::decode(bytes)?)
}

pub fn encode_feed(feed: &FeedMessage) -> Vec<u8> {
    feed.encode_to_vec()
}

/// Reads a feed from an `http(s)://` URL or a local file path.
pub async fn read_feed<C: HttpClient>(client: &C, location: &str) -> Result<FeedMessage> {
    let bytes = if location.starts_with("http://") || location.starts_with("https://") {
        fetch_bytes(client, location).await?
    } else {
        tokio::fs::read(location)
            .await
            .with_context(|| format!("reading feed '{location}'"))?
    };
    parse_feed(&bytes).with_context(|| format!("decoding feed '{location}'"))
}
