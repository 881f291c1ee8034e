//! Convergence tier selection.
//!
//! Runs once per review, after the initial scoring pass. Risk signals are
//! checked before size signals so a small security-sensitive changeset
//! still gets the deepest tier.

use crate::models::{ChunkType, Notice, NoticeKind, ResolvedChangeset};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Files at or above this risk factor (auth, crypto, payment, migrations) force THOROUGH.
pub const HIGH_RISK_FACTOR: f64 = 2.0;
/// Mean complexity above this forces THOROUGH.
pub const HIGH_MEAN_COMPLEXITY: f64 = 2.0;
/// More files than this forces THOROUGH.
pub const LARGE_CHANGESET_FILES: usize = 40;
/// At most this many files selects MINIMAL.
pub const SMALL_CHANGESET_FILES: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TierName {
    Minimal,
    Standard,
    Thorough,
}

impl TierName {
    /// Retry rounds allowed after the initial round.
    pub fn max_rounds(&self) -> usize {
        match self {
            TierName::Minimal => 1,
            TierName::Standard => 2,
            TierName::Thorough => 3,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "minimal" => Some(TierName::Minimal),
            "standard" => Some(TierName::Standard),
            "thorough" => Some(TierName::Thorough),
            _ => None,
        }
    }
}

impl fmt::Display for TierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierName::Minimal => write!(f, "MINIMAL"),
            TierName::Standard => write!(f, "STANDARD"),
            TierName::Thorough => write!(f, "THOROUGH"),
        }
    }
}

/// The retry budget for a run. Immutable once selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceTier {
    pub name: TierName,
    pub max_rounds: usize,
    /// The signal that triggered the selection.
    pub reason: String,
}

impl ConvergenceTier {
    pub fn new(name: TierName, reason: impl Into<String>) -> Self {
        Self {
            name,
            max_rounds: name.max_rounds(),
            reason: reason.into(),
        }
    }
}

/// Risk and size signals of the changeset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSignals {
    pub total_files: usize,
    pub max_risk_factor: f64,
    pub riskiest_file: Option<String>,
    pub mean_complexity: f64,
    pub all_docs: bool,
}

impl TierSignals {
    pub fn from_changeset(changeset: &ResolvedChangeset) -> Self {
        let mut total_files = 0usize;
        let mut complexity_sum = 0.0;
        let mut max_risk_factor = 0.0;
        let mut riskiest_file = None;

        for file in changeset.chunked_files() {
            total_files += 1;
            complexity_sum += file.complexity;
            if riskiest_file.is_none() || file.risk_factor > max_risk_factor {
                max_risk_factor = file.risk_factor;
                riskiest_file = Some(file.path.clone());
            }
        }

        let mean_complexity = if total_files == 0 {
            0.0
        } else {
            complexity_sum / total_files as f64
        };

        let all_docs = !changeset.chunks.is_empty()
            && changeset
                .chunks
                .iter()
                .all(|c| c.chunk_type == ChunkType::Doc);

        Self {
            total_files,
            max_risk_factor,
            riskiest_file,
            mean_complexity,
            all_docs,
        }
    }
}

/// Choose the convergence tier. First matching rule wins.
pub fn select_tier(
    signals: &TierSignals,
    tier_override: Option<&str>,
    notices: &mut Vec<Notice>,
) -> ConvergenceTier {
    let tier = choose(signals, tier_override, notices);
    info!(
        "Selected convergence tier {} (max {} retry rounds): {}",
        tier.name, tier.max_rounds, tier.reason
    );
    tier
}

fn choose(
    signals: &TierSignals,
    tier_override: Option<&str>,
    notices: &mut Vec<Notice>,
) -> ConvergenceTier {
    if let Some(raw) = tier_override {
        match TierName::parse(raw) {
            Some(name) => return ConvergenceTier::new(name, format!("explicit override '{}'", raw.trim())),
            None => {
                warn!("Ignoring invalid tier override '{}'", raw);
                notices.push(Notice::new(
                    NoticeKind::TierOverrideIgnored,
                    format!(
                        "tier override '{}' is not one of minimal, standard, thorough",
                        raw
                    ),
                ));
            }
        }
    }

    if signals.total_files == 0 {
        return ConvergenceTier::new(TierName::Minimal, "empty changeset");
    }

    if signals.max_risk_factor >= HIGH_RISK_FACTOR {
        return ConvergenceTier::new(
            TierName::Thorough,
            format!(
                "high-risk file {} (risk factor {:.1})",
                signals.riskiest_file.as_deref().unwrap_or("?"),
                signals.max_risk_factor
            ),
        );
    }

    if signals.mean_complexity > HIGH_MEAN_COMPLEXITY {
        return ConvergenceTier::new(
            TierName::Thorough,
            format!("mean complexity {:.2} > {}", signals.mean_complexity, HIGH_MEAN_COMPLEXITY),
        );
    }

    if signals.total_files > LARGE_CHANGESET_FILES {
        return ConvergenceTier::new(
            TierName::Thorough,
            format!("{} files > {}", signals.total_files, LARGE_CHANGESET_FILES),
        );
    }

    if signals.all_docs {
        return ConvergenceTier::new(TierName::Minimal, "documentation-only changeset");
    }

    if signals.total_files <= SMALL_CHANGESET_FILES {
        return ConvergenceTier::new(
            TierName::Minimal,
            format!("{} files <= {}", signals.total_files, SMALL_CHANGESET_FILES),
        );
    }

    ConvergenceTier::new(
        TierName::Standard,
        format!("{} files, no high-risk signals", signals.total_files),
    )
}
