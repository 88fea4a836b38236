pub mod batch;
pub mod config;
pub mod error;
pub mod network;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use batch::{BatchDriver, BatchReport, CaptureJob, CapturePipeline, ExtractionSummary};
pub use config::Config;
pub use error::{FlowStatsError, Result};
