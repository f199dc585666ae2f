//! Evaluation metrics.

pub mod metrics;

pub use metrics::{PerfReport, compute_perf};
