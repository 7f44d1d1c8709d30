//! Vehicle location reports: the normalized shape, its validation rules and
//! the sources that produce it.

pub mod report;
pub mod source;

pub use report::AvlReport;
pub use source::{AvlSource, CsvAvlSource, GtfsRtAvlSource, read_reports, vehicle_reports};
