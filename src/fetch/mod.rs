//! HTTP transport for upstream GTFS-realtime feeds.

mod basic;
mod client;
pub mod auth;

pub use basic::BasicClient;
pub use client::{HttpClient, fetch_bytes};
