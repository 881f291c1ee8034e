//! Run driver and finding aggregation helpers.
//!
//! [`ReviewRun`] wires the pipeline together for one review: extraction,
//! within-round dedup, per-chunk scoring, tier selection, convergence
//! evaluation, cross-round merge and, for retries, context selection.
//! Each call to [`ReviewRun::ingest_round`] consumes one fully collected
//! round of worker output.

use crate::analysis::context::select_context;
use crate::analysis::convergence::{ChunkOutcome, ConvergenceEvaluator, Round, Verdict};
use crate::analysis::dedup::{dedup, merge_rounds};
use crate::analysis::extractor::{FindingExtractor, WorkerOutput};
use crate::analysis::hierarchy::DedupHierarchy;
use crate::analysis::scorer::{score, ScoreNote, ThresholdProfiles};
use crate::analysis::tier::{select_tier, ConvergenceTier, TierSignals};
use crate::config::Config;
use crate::error::{AggregationError, AggregationResult};
use crate::models::{Changeset, Finding, Notice, NoticeKind, Producer, ResolvedChangeset};
use crate::report::ConvergenceReport;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

/// What one ingested round produced, for the dispatch layer.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub round: Round,
    /// Chunks to re-review next round. Empty unless the verdict is `retry`.
    pub flagged_chunks: Vec<usize>,
    /// Read-only context files per flagged chunk.
    pub context: BTreeMap<usize, Vec<String>>,
    /// Findings extracted this round, after within-round dedup.
    pub findings: usize,
}

/// Final output of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub report: ConvergenceReport,
    pub findings: Vec<Finding>,
}

/// State of one review run across rounds.
#[derive(Debug)]
pub struct ReviewRun {
    config: Config,
    changeset: ResolvedChangeset,
    profiles: ThresholdProfiles,
    extractor: FindingExtractor,
    hierarchy: Option<DedupHierarchy>,
    evaluator: Option<ConvergenceEvaluator>,
    max_context_files: usize,
    findings: Vec<Finding>,
    context: BTreeMap<usize, Vec<String>>,
    reported_unknown: HashSet<Producer>,
    notices: Vec<Notice>,
}

impl ReviewRun {
    /// Validate the changeset and resolve the threshold profiles.
    pub fn new(changeset: &Changeset, config: Config) -> AggregationResult<Self> {
        let (changeset, mut notices) = changeset.resolve(&config.changeset.source_extensions)?;
        let (profiles, threshold_notices) = ThresholdProfiles::from_config(&config.scoring);
        notices.extend(threshold_notices);
        let (max_context_files, cap_notice) = config.context.effective_max_files();
        notices.extend(cap_notice);

        info!(
            "Review run: {} chunk(s), {} file(s)",
            changeset.chunks.len(),
            changeset.file_count()
        );

        Ok(Self {
            config,
            changeset,
            profiles,
            extractor: FindingExtractor::new(),
            hierarchy: None,
            evaluator: None,
            max_context_files,
            findings: Vec::new(),
            context: BTreeMap::new(),
            reported_unknown: HashSet::new(),
            notices,
        })
    }

    pub fn changeset(&self) -> &ResolvedChangeset {
        &self.changeset
    }

    /// Index of the next round to ingest.
    pub fn next_round(&self) -> usize {
        self.evaluator
            .as_ref()
            .map(ConvergenceEvaluator::next_round)
            .unwrap_or(0)
    }

    pub fn tier(&self) -> Option<&ConvergenceTier> {
        self.evaluator.as_ref().map(ConvergenceEvaluator::tier)
    }

    pub fn history(&self) -> &[Round] {
        self.evaluator
            .as_ref()
            .map(ConvergenceEvaluator::history)
            .unwrap_or_default()
    }

    /// Verdict of the latest round, if any round has been ingested.
    pub fn verdict(&self) -> Option<Verdict> {
        self.history().last().map(|r| r.verdict)
    }

    pub fn is_finished(&self) -> bool {
        self.verdict().is_some_and(|v| v.is_terminal())
    }

    /// Chunks the next round must re-review.
    pub fn flagged_chunks(&self) -> Vec<usize> {
        self.evaluator
            .as_ref()
            .map(ConvergenceEvaluator::flagged_chunks)
            .unwrap_or_default()
    }

    /// Context files for each flagged chunk.
    pub fn context(&self) -> &BTreeMap<usize, Vec<String>> {
        &self.context
    }

    /// The running, merged finding set.
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    /// Chunks whose worker output the next round should contain.
    pub fn expected_chunks(&self) -> Vec<usize> {
        match &self.evaluator {
            Some(evaluator) => evaluator.expected_chunks(),
            None => self.changeset.chunk_indices(),
        }
    }

    /// Ingest one fully collected round of worker output.
    pub fn ingest_round(&mut self, outputs: Vec<WorkerOutput>) -> AggregationResult<RoundOutcome> {
        if let Some(verdict) = self.verdict().filter(Verdict::is_terminal) {
            return Err(AggregationError::RunFinished { verdict });
        }

        let round = self.next_round();
        let expected: BTreeSet<usize> = self.expected_chunks().into_iter().collect();
        let outputs = self.filter_outputs(round, &expected, outputs);

        let with_output: BTreeSet<usize> = outputs.iter().map(|o| o.chunk).collect();
        let reviewable: Vec<usize> = expected
            .iter()
            .copied()
            .filter(|c| self.changeset.chunk(*c).is_some_and(|chunk| !chunk.files.is_empty()))
            .collect();
        if !reviewable.is_empty() && !reviewable.iter().any(|c| with_output.contains(c)) {
            return Err(AggregationError::SystemicFailure { round });
        }

        if self.hierarchy.is_none() {
            let active: BTreeSet<&Producer> = outputs.iter().map(|o| &o.producer).collect();
            let (hierarchy, notices) = DedupHierarchy::build(&self.config.dedup, active);
            self.record(round, notices);
            self.hierarchy = Some(hierarchy);
        }
        let hierarchy = self.hierarchy.clone().unwrap_or_default();
        self.report_unknown_producers(round, &hierarchy, &outputs);

        let mut extracted = Vec::new();
        for output in &outputs {
            let extraction = self.extractor.extract(output, &hierarchy);
            self.record(round, extraction.all_notices());
            extracted.extend(extraction.findings);
        }
        let round_findings = dedup(extracted, &hierarchy);
        let by_chunk = group_by_chunk(&round_findings, &self.changeset);

        let mut outcomes = Vec::with_capacity(expected.len());
        let mut notes = Vec::new();
        for &index in &expected {
            let Some(chunk) = self.changeset.chunk(index) else {
                continue;
            };
            if !chunk.files.is_empty() && !with_output.contains(&index) {
                continue;
            }
            let chunk_findings = by_chunk.get(&index).map(Vec::as_slice).unwrap_or_default();
            let metrics = score(chunk, chunk_findings, &self.profiles);
            if let Some(note) = metrics.note {
                let kind = match note {
                    ScoreNote::EmptyChunk => NoticeKind::ChunkEmpty,
                    ScoreNote::TooSmall { .. } => NoticeKind::ChunkTooSmall,
                };
                notes.push(Notice::new(kind, format!("chunk {} auto-passed: {}", index, note)));
            }
            outcomes.push(ChunkOutcome::Scored(metrics));
        }
        self.record(round, notes);

        if self.evaluator.is_none() {
            let signals = TierSignals::from_changeset(&self.changeset);
            let mut notices = Vec::new();
            let tier_override = self.config.convergence.tier_override();
            let tier = select_tier(&signals, tier_override.as_deref(), &mut notices);
            self.record(round, notices);
            self.evaluator = Some(ConvergenceEvaluator::new(tier, self.changeset.chunk_indices()));
        }

        let record = match self.evaluator.as_mut() {
            Some(evaluator) => evaluator.evaluate(outcomes)?.clone(),
            None => return Err(AggregationError::SystemicFailure { round }),
        };

        let not_scored: Vec<Notice> = record
            .chunk_metrics
            .iter()
            .filter_map(|outcome| match outcome {
                ChunkOutcome::NotScored { chunk, reason } => Some(Notice::new(
                    NoticeKind::ChunkNotScored,
                    format!("chunk {} not scored ({}); counted as failing", chunk, reason),
                )),
                ChunkOutcome::Scored(_) => None,
            })
            .collect();
        self.record(round, not_scored);

        let new_findings = round_findings.len();
        self.findings = merge_rounds(std::mem::take(&mut self.findings), round_findings, &hierarchy);

        self.context.clear();
        if record.verdict == Verdict::Retry {
            self.select_retry_context(round, &record.failing_chunks);
        }

        Ok(RoundOutcome {
            flagged_chunks: self.flagged_chunks(),
            context: self.context.clone(),
            findings: new_findings,
            round: record,
        })
    }

    /// Close the run: final dedup pass and the convergence report.
    pub fn finish(mut self) -> RunResult {
        let hierarchy = self.hierarchy.take().unwrap_or_default();
        let findings = dedup(std::mem::take(&mut self.findings), &hierarchy);

        let tier = match self.evaluator.as_ref() {
            Some(evaluator) => evaluator.tier().clone(),
            None => {
                let signals = TierSignals::from_changeset(&self.changeset);
                let mut notices = Vec::new();
                let tier_override = self.config.convergence.tier_override();
                let tier = select_tier(&signals, tier_override.as_deref(), &mut notices);
                self.notices.extend(notices);
                tier
            }
        };

        let report = ConvergenceReport::new(
            tier,
            self.history().to_vec(),
            self.flagged_chunks(),
            self.context.clone(),
            &findings,
            self.notices,
        );

        RunResult { report, findings }
    }

    fn filter_outputs(
        &self,
        round: usize,
        expected: &BTreeSet<usize>,
        outputs: Vec<WorkerOutput>,
    ) -> Vec<WorkerOutput> {
        outputs
            .into_iter()
            .filter_map(|mut output| {
                if !expected.contains(&output.chunk) {
                    debug!(
                        "Round {}: ignoring {} output for chunk {} (not expected)",
                        round, output.producer, output.chunk
                    );
                    return None;
                }
                if output.round != round {
                    warn!(
                        "Output from {} for chunk {} is stamped round {}; treating as round {}",
                        output.producer, output.chunk, output.round, round
                    );
                    output.round = round;
                }
                Some(output)
            })
            .collect()
    }

    fn report_unknown_producers(
        &mut self,
        round: usize,
        hierarchy: &DedupHierarchy,
        outputs: &[WorkerOutput],
    ) {
        let unknown: BTreeSet<&Producer> = outputs
            .iter()
            .map(|o| &o.producer)
            .filter(|p| !hierarchy.contains(p))
            .collect();
        let mut notices = Vec::new();
        for producer in unknown {
            if self.reported_unknown.insert(producer.clone()) {
                warn!("Producer '{}' joined after round 0; ranked lowest", producer);
                notices.push(Notice::new(
                    NoticeKind::UnknownProducer,
                    format!("producer '{}' is not in the dedup hierarchy; ranked lowest", producer),
                ));
            }
        }
        self.record(round, notices);
    }

    fn select_retry_context(&mut self, round: usize, flagged: &[usize]) {
        let max_files = self.max_context_files;
        let mut notices = Vec::new();
        for &index in flagged {
            let Some(chunk) = self.changeset.chunk(index) else {
                continue;
            };
            let (paths, chunk_notices) =
                select_context(chunk, &self.changeset, &self.findings, max_files);
            notices.extend(chunk_notices);
            if !paths.is_empty() {
                debug!("Chunk {} context: {:?}", index, paths);
                self.context.insert(index, paths);
            }
        }
        self.record(round, notices);
    }

    fn record(&mut self, round: usize, notices: Vec<Notice>) {
        self.notices.extend(notices.into_iter().map(|n| match n.round {
            Some(_) => n,
            None => n.in_round(round),
        }));
    }
}

/// Group findings by the chunk that owns their file. Findings on files
/// outside the changeset are left out.
pub fn group_by_chunk(
    findings: &[Finding],
    changeset: &ResolvedChangeset,
) -> BTreeMap<usize, Vec<Finding>> {
    let mut grouped: BTreeMap<usize, Vec<Finding>> = BTreeMap::new();
    let mut outside = 0usize;

    for finding in findings {
        match changeset.chunk_of(&finding.location.file) {
            Some(chunk) => grouped.entry(chunk).or_default().push(finding.clone()),
            None => outside += 1,
        }
    }

    if outside > 0 {
        debug!("{} finding(s) point outside the changeset", outside);
    }

    grouped
}

/// Group findings by file path.
pub fn group_by_file(findings: &[Finding]) -> HashMap<String, Vec<Finding>> {
    let mut grouped: HashMap<String, Vec<Finding>> = HashMap::new();

    for finding in findings {
        grouped
            .entry(finding.location.file.clone())
            .or_default()
            .push(finding.clone());
    }

    // Sort findings within each file by line number
    for findings in grouped.values_mut() {
        findings.sort_by_key(|f| f.location.line);
    }

    grouped
}

/// Identify the most flagged files (by finding count).
pub fn most_flagged_files(findings: &[Finding], n: usize) -> Vec<(String, usize)> {
    let mut file_counts: Vec<(String, usize)> = group_by_file(findings)
        .into_iter()
        .map(|(path, findings)| (path, findings.len()))
        .collect();

    file_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    file_counts.truncate(n);

    file_counts
}
