pub mod assignment;
pub mod avl;
pub mod config;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod matching;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod prediction;
pub mod query;
pub mod schedule;
pub mod stats;
pub mod store;
pub mod travel_time;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
