//! GTFS-realtime output: generation from the state store and publication.

pub mod generator;
pub mod publisher;

pub use generator::{FeedGenerator, GeneratedFeed};
pub use publisher::{FeedPublisher, FeedSink, FileSink, S3Sink, spawn_publisher};
