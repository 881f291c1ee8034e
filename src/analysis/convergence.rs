//! Convergence control loop.
//!
//! Each round the evaluator consumes chunk outcomes, updates the pass state
//! of the chunks it expected, and decides whether to converge, retry the
//! still-failing chunks, or halt. History is append-only: one [`Round`] per
//! completed round, indexed from 0.

use crate::analysis::scorer::QualityMetrics;
use crate::analysis::tier::ConvergenceTier;
use crate::error::{AggregationError, AggregationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Converged,
    Retry,
    Halted,
}

impl Verdict {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Verdict::Retry)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Converged => write!(f, "converged"),
            Verdict::Retry => write!(f, "retry"),
            Verdict::Halted => write!(f, "halted"),
        }
    }
}

/// Why the loop stopped without converging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// The tier's retry budget is spent.
    RoundBudgetExhausted,
    /// Same failing count as the previous round.
    Stagnation,
    /// More failing chunks than the previous round.
    Regression,
    /// The failing count repeats one seen in an earlier round.
    Oscillation,
    /// Improvement followed by a worsening past the best point reached.
    TrendReversal,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::RoundBudgetExhausted => write!(f, "round budget exhausted"),
            HaltReason::Stagnation => write!(f, "stagnation"),
            HaltReason::Regression => write!(f, "regression"),
            HaltReason::Oscillation => write!(f, "oscillation"),
            HaltReason::TrendReversal => write!(f, "trend reversal"),
        }
    }
}

/// Result of trying to score one chunk in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkOutcome {
    Scored(QualityMetrics),
    /// No metrics this round. Always counted as failing.
    NotScored { chunk: usize, reason: String },
}

impl ChunkOutcome {
    pub fn missing(chunk: usize) -> Self {
        ChunkOutcome::NotScored {
            chunk,
            reason: "no worker output this round".to_string(),
        }
    }

    pub fn chunk(&self) -> usize {
        match self {
            ChunkOutcome::Scored(m) => m.chunk,
            ChunkOutcome::NotScored { chunk, .. } => *chunk,
        }
    }

    pub fn passes(&self) -> bool {
        match self {
            ChunkOutcome::Scored(m) => m.pass,
            ChunkOutcome::NotScored { .. } => false,
        }
    }

    pub fn metrics(&self) -> Option<&QualityMetrics> {
        match self {
            ChunkOutcome::Scored(m) => Some(m),
            ChunkOutcome::NotScored { .. } => None,
        }
    }
}

/// One completed round of review, scoring and evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub index: usize,
    pub chunk_metrics: Vec<ChunkOutcome>,
    /// Chunks failing after this round. Flagged for retry when the verdict is `retry`.
    pub failing_chunks: Vec<usize>,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<HaltReason>,
    pub timestamp: DateTime<Utc>,
}

impl Round {
    pub fn failing_count(&self) -> usize {
        self.failing_chunks.len()
    }
}

/// Decide the verdict for `round` given its failing-chunk count and the
/// counts of every earlier round.
///
/// Checks run in a fixed order: convergence, round budget, exact-repeat
/// oscillation, trend reversal, then stagnation/regression against the
/// immediately preceding round. A check that fires always halts, so the
/// order only selects which reason is reported.
pub fn decide(
    round: usize,
    failing: usize,
    prior_counts: &[usize],
    tier: &ConvergenceTier,
) -> (Verdict, Option<HaltReason>) {
    if failing == 0 {
        return (Verdict::Converged, None);
    }

    if round >= tier.max_rounds {
        return (Verdict::Halted, Some(HaltReason::RoundBudgetExhausted));
    }

    let Some((&previous, earlier)) = prior_counts.split_last() else {
        return (Verdict::Retry, None);
    };

    if prior_counts.len() >= 2 && failing != previous && earlier.contains(&failing) {
        return (Verdict::Halted, Some(HaltReason::Oscillation));
    }

    if let [.., before, last] = prior_counts {
        let best = prior_counts.iter().copied().min().unwrap_or(*last);
        if last < before && failing > best {
            return (Verdict::Halted, Some(HaltReason::TrendReversal));
        }
    }

    if failing > previous {
        return (Verdict::Halted, Some(HaltReason::Regression));
    }
    if failing == previous {
        return (Verdict::Halted, Some(HaltReason::Stagnation));
    }

    (Verdict::Retry, None)
}

/// Owns the round history and the pass state of every chunk.
#[derive(Debug, Clone)]
pub struct ConvergenceEvaluator {
    tier: ConvergenceTier,
    status: BTreeMap<usize, bool>,
    history: Vec<Round>,
}

impl ConvergenceEvaluator {
    pub fn new(tier: ConvergenceTier, chunks: impl IntoIterator<Item = usize>) -> Self {
        Self {
            tier,
            status: chunks.into_iter().map(|c| (c, false)).collect(),
            history: Vec::new(),
        }
    }

    pub fn tier(&self) -> &ConvergenceTier {
        &self.tier
    }

    pub fn history(&self) -> &[Round] {
        &self.history
    }

    pub fn last_round(&self) -> Option<&Round> {
        self.history.last()
    }

    /// Index of the next round to evaluate.
    pub fn next_round(&self) -> usize {
        self.history.len()
    }

    pub fn failing_counts(&self) -> Vec<usize> {
        self.history.iter().map(Round::failing_count).collect()
    }

    /// Chunks the next round must re-review. Empty once the loop has ended.
    pub fn flagged_chunks(&self) -> Vec<usize> {
        match self.history.last() {
            Some(round) if round.verdict == Verdict::Retry => round.failing_chunks.clone(),
            _ => Vec::new(),
        }
    }

    /// Chunks whose outcome the next round is expected to provide.
    pub fn expected_chunks(&self) -> Vec<usize> {
        if self.history.is_empty() {
            self.status.keys().copied().collect()
        } else {
            self.flagged_chunks()
        }
    }

    /// Evaluate one completed round and append it to the history.
    ///
    /// Outcomes for chunks that were not expected this round are ignored;
    /// expected chunks with no outcome count as failing.
    pub fn evaluate(&mut self, outcomes: Vec<ChunkOutcome>) -> AggregationResult<&Round> {
        if let Some(last) = self.history.last() {
            if last.verdict.is_terminal() {
                return Err(AggregationError::RunFinished {
                    verdict: last.verdict,
                });
            }
        }

        let index = self.next_round();
        let expected: BTreeSet<usize> = self.expected_chunks().into_iter().collect();

        let mut provided: BTreeMap<usize, ChunkOutcome> = BTreeMap::new();
        for outcome in outcomes {
            let chunk = outcome.chunk();
            if expected.contains(&chunk) {
                provided.insert(chunk, outcome);
            } else {
                debug!("Round {}: ignoring outcome for chunk {} (not flagged)", index, chunk);
            }
        }

        if !expected.is_empty() && provided.is_empty() {
            return Err(AggregationError::SystemicFailure { round: index });
        }

        let chunk_metrics: Vec<ChunkOutcome> = expected
            .iter()
            .map(|chunk| {
                provided
                    .remove(chunk)
                    .unwrap_or_else(|| ChunkOutcome::missing(*chunk))
            })
            .collect();

        for outcome in &chunk_metrics {
            if let ChunkOutcome::NotScored { chunk, reason } = outcome {
                warn!("Round {}: chunk {} not scored ({}); counting as failing", index, chunk, reason);
            }
            self.status.insert(outcome.chunk(), outcome.passes());
        }

        let failing_chunks: Vec<usize> = self
            .status
            .iter()
            .filter(|(_, pass)| !**pass)
            .map(|(chunk, _)| *chunk)
            .collect();

        let prior = self.failing_counts();
        let (verdict, halt_reason) = decide(index, failing_chunks.len(), &prior, &self.tier);

        match halt_reason {
            Some(reason) => info!(
                "Round {}: {} failing chunk(s) -> {} ({})",
                index,
                failing_chunks.len(),
                verdict,
                reason
            ),
            None => info!(
                "Round {}: {} failing chunk(s) -> {}",
                index,
                failing_chunks.len(),
                verdict
            ),
        }

        self.history.push(Round {
            index,
            chunk_metrics,
            failing_chunks,
            verdict,
            halt_reason,
            timestamp: Utc::now(),
        });

        Ok(&self.history[index])
    }
}

/// Overall direction of the failing-chunk counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    SingleRound,
    Improving,
    Flat,
    Worsening,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub failing_counts: Vec<usize>,
    pub direction: TrendDirection,
}

impl TrendSummary {
    pub fn from_counts(counts: &[usize]) -> Self {
        let direction = if counts.len() < 2 {
            TrendDirection::SingleRound
        } else if counts.windows(2).all(|w| w[1] < w[0]) {
            TrendDirection::Improving
        } else if counts.windows(2).all(|w| w[1] == w[0]) {
            TrendDirection::Flat
        } else if counts.windows(2).all(|w| w[1] >= w[0]) {
            TrendDirection::Worsening
        } else {
            TrendDirection::Mixed
        };

        Self {
            failing_counts: counts.to_vec(),
            direction,
        }
    }
}

impl fmt::Display for TrendSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<String> = self.failing_counts.iter().map(|c| c.to_string()).collect();
        write!(f, "{} ({:?})", counts.join(" -> "), self.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tier::TierName;
    use crate::models::ChunkType;

    fn tier(name: TierName) -> ConvergenceTier {
        ConvergenceTier::new(name, "test")
    }

    fn metrics(chunk: usize, pass: bool) -> ChunkOutcome {
        ChunkOutcome::Scored(QualityMetrics {
            chunk,
            chunk_type: ChunkType::Code,
            files: 4,
            findings: 2,
            finding_density: 0.5,
            evidence_ratio: 1.0,
            confidence_mean: 0.9,
            coverage_completeness: if pass { 0.5 } else { 0.2 },
            pass,
            failed: Vec::new(),
            note: None,
        })
    }

    /// Drive the evaluator so each round ends with `count` failing chunks.
    fn run_counts(counts: &[usize], tier_name: TierName) -> Vec<(Verdict, Option<HaltReason>)> {
        let total = counts.iter().copied().max().unwrap_or(0);
        let mut evaluator = ConvergenceEvaluator::new(tier(tier_name), 0..total);
        let mut verdicts = Vec::new();

        for &count in counts {
            let expected = evaluator.expected_chunks();
            // Chunks are re-failed by index so the resulting count is `count`
            // even when it grows past the previous round's flagged set.
            let outcomes = expected
                .iter()
                .enumerate()
                .map(|(i, c)| metrics(*c, i >= count))
                .collect();
            let round = evaluator.evaluate(outcomes).unwrap();
            verdicts.push((round.verdict, round.halt_reason));
        }
        verdicts
    }

    #[test]
    fn test_decide_round_zero() {
        let t = tier(TierName::Minimal);
        assert_eq!(decide(0, 0, &[], &t), (Verdict::Converged, None));
        assert_eq!(decide(0, 3, &[], &t), (Verdict::Retry, None));
    }

    #[test]
    fn test_oscillation_halts() {
        let t = tier(TierName::Thorough);
        assert_eq!(
            decide(2, 3, &[3, 2], &t),
            (Verdict::Halted, Some(HaltReason::Oscillation))
        );
    }

    #[test]
    fn test_regression_halts() {
        let t = tier(TierName::Thorough);
        assert_eq!(
            decide(1, 4, &[3], &t),
            (Verdict::Halted, Some(HaltReason::Regression))
        );
    }

    #[test]
    fn test_stagnation_halts() {
        let t = tier(TierName::Thorough);
        assert_eq!(
            decide(1, 3, &[3], &t),
            (Verdict::Halted, Some(HaltReason::Stagnation))
        );
    }

    #[test]
    fn test_trend_reversal_halts() {
        let t = tier(TierName::Thorough);
        assert_eq!(
            decide(2, 3, &[4, 2], &t),
            (Verdict::Halted, Some(HaltReason::TrendReversal))
        );
    }

    #[test]
    fn test_convergence_sequence() {
        let t = tier(TierName::Thorough);
        assert_eq!(decide(1, 1, &[3], &t), (Verdict::Retry, None));
        assert_eq!(decide(2, 0, &[3, 1], &t), (Verdict::Converged, None));
    }

    #[test]
    fn test_circuit_breaker() {
        let t = tier(TierName::Standard);
        assert_eq!(decide(1, 2, &[3], &t), (Verdict::Retry, None));
        assert_eq!(
            decide(2, 1, &[3, 2], &t),
            (Verdict::Halted, Some(HaltReason::RoundBudgetExhausted))
        );
        // Convergence still wins on the last permitted round.
        assert_eq!(decide(2, 0, &[3, 2], &t), (Verdict::Converged, None));
    }

    #[test]
    fn test_evaluator_converges_over_three_rounds() {
        let verdicts = run_counts(&[3, 1, 0], TierName::Thorough);
        assert_eq!(verdicts[0].0, Verdict::Retry);
        assert_eq!(verdicts[1].0, Verdict::Retry);
        assert_eq!(verdicts[2], (Verdict::Converged, None));
    }

    #[test]
    fn test_missing_chunk_counts_as_failing() {
        let mut evaluator = ConvergenceEvaluator::new(tier(TierName::Thorough), 0..4);
        evaluator
            .evaluate(vec![metrics(0, true), metrics(1, false), metrics(2, false), metrics(3, false)])
            .unwrap();
        assert_eq!(evaluator.flagged_chunks(), vec![1, 2, 3]);

        // Only flagged chunks are re-scored; an outcome for chunk 0 is ignored.
        let round = evaluator
            .evaluate(vec![metrics(0, false), metrics(1, false), metrics(2, false)])
            .unwrap();
        // Chunk 3 had no output: counted as failing, so the count stays at 3.
        assert_eq!(round.failing_chunks, vec![1, 2, 3]);
        assert_eq!(round.verdict, Verdict::Halted);
        assert_eq!(round.halt_reason, Some(HaltReason::Stagnation));
        assert!(matches!(
            round.chunk_metrics[2],
            ChunkOutcome::NotScored { chunk: 3, .. }
        ));
    }

    #[test]
    fn test_passed_chunks_keep_status() {
        let mut evaluator = ConvergenceEvaluator::new(tier(TierName::Thorough), 0..3);
        evaluator
            .evaluate(vec![metrics(0, true), metrics(1, false), metrics(2, false)])
            .unwrap();
        let round = evaluator.evaluate(vec![metrics(1, true), metrics(2, false)]).unwrap();
        assert_eq!(round.failing_chunks, vec![2]);
        assert_eq!(round.verdict, Verdict::Retry);
        assert_eq!(round.chunk_metrics.len(), 2);
    }

    #[test]
    fn test_systemic_failure() {
        let mut evaluator = ConvergenceEvaluator::new(tier(TierName::Standard), 0..2);
        let err = evaluator.evaluate(Vec::new()).unwrap_err();
        assert!(matches!(err, AggregationError::SystemicFailure { round: 0 }));
        assert!(evaluator.history().is_empty());
    }

    #[test]
    fn test_no_rounds_after_terminal_verdict() {
        let mut evaluator = ConvergenceEvaluator::new(tier(TierName::Standard), 0..1);
        evaluator.evaluate(vec![metrics(0, true)]).unwrap();
        assert!(matches!(
            evaluator.evaluate(vec![metrics(0, true)]),
            Err(AggregationError::RunFinished { verdict: Verdict::Converged })
        ));
    }

    #[test]
    fn test_empty_run_converges() {
        let mut evaluator = ConvergenceEvaluator::new(tier(TierName::Minimal), Vec::new());
        let round = evaluator.evaluate(Vec::new()).unwrap();
        assert_eq!(round.verdict, Verdict::Converged);
    }

    #[test]
    fn test_trend_summary() {
        assert_eq!(TrendSummary::from_counts(&[3, 1, 0]).direction, TrendDirection::Improving);
        assert_eq!(TrendSummary::from_counts(&[3, 4]).direction, TrendDirection::Worsening);
        assert_eq!(TrendSummary::from_counts(&[3, 2, 3]).direction, TrendDirection::Mixed);
        assert_eq!(TrendSummary::from_counts(&[2]).direction, TrendDirection::SingleRound);
        assert_eq!(TrendSummary::from_counts(&[3, 1, 0]).to_string(), "3 -> 1 -> 0 (Improving)");
    }
}
