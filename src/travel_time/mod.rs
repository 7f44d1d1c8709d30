//! Historical segment travel times feeding the prediction engine.

pub mod model;
pub mod repository;

pub use crate::schedule::DayType;
pub use model::{TravelTimeModel, TravelTimeStat};
pub use repository::{CsvStatRepository, S3StatArchive, TravelTimeRepository};
