//! Analysis modules.
//!
//! The aggregation core: extraction, scoring, tier selection, convergence
//! evaluation, deduplication and cross-chunk context, plus the run driver
//! that wires them together.

pub mod aggregator;
pub mod context;
pub mod convergence;
pub mod dedup;
pub mod extractor;
pub mod hierarchy;
pub mod scorer;
pub mod tier;

pub use aggregator::*;
