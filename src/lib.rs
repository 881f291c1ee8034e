//! ReviewConverge - aggregation core for parallel code reviewers.
//!
//! Parses worker output into findings, scores each chunk against a quality
//! gate, runs the convergence loop across review rounds, and deduplicates
//! the findings into a final ordered set with a convergence report.

pub mod analysis;
pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod report;
pub mod scanner;

pub use analysis::aggregator::{ReviewRun, RoundOutcome, RunResult};
pub use analysis::extractor::WorkerOutput;
pub use config::Config;
pub use error::{AggregationError, AggregationResult};
