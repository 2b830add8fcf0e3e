pub mod demo;
pub mod downstream;
pub mod ingest;

// Re-export main types
pub use demo::{run_demo, spawn_stats_reporter, DemoConfig, DemoSummary};
pub use downstream::{DownstreamError, FlakyDownstream, Receipt};
pub use ingest::ReportIngest;
