//! Error types for the aggregation core.
//!
//! Only systemic failures and unusable input abort a run. Everything that
//! can be defaulted is recorded as a [`crate::models::Notice`] instead.

use crate::analysis::convergence::Verdict;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Systemic failure: no worker output for any expected chunk in round {round}")]
    SystemicFailure { round: usize },

    #[error("Invalid changeset: {0}")]
    InvalidChangeset(String),

    #[error("Run already finished with verdict {verdict}; no further rounds accepted")]
    RunFinished { verdict: Verdict },
}

pub type AggregationResult<T> = Result<T, AggregationError>;
