//! Convergence report generation.
//!
//! This module builds the per-run convergence report record, serializes
//! it to JSON together with the final finding set, and renders the short
//! plain-text summary printed at the end of a run.

use crate::analysis::aggregator::{most_flagged_files, RunResult};
use crate::analysis::convergence::{HaltReason, Round, TrendSummary, Verdict};
use crate::analysis::tier::ConvergenceTier;
use crate::models::{Finding, FindingSummary, Notice};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Per-run convergence record consumed by reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub generated_at: DateTime<Utc>,
    pub tier: ConvergenceTier,
    pub rounds: Vec<Round>,
    /// `None` when no round was ingested; `retry` when the next round is pending.
    pub final_verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<HaltReason>,
    pub trend: TrendSummary,
    /// Chunks awaiting re-review when the run stopped on `retry`.
    pub flagged_chunks: Vec<usize>,
    /// Context files per flagged chunk.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<usize, Vec<String>>,
    pub summary: FindingSummary,
    /// Every degraded or defaulted decision made during the run.
    pub notices: Vec<Notice>,
}

impl ConvergenceReport {
    pub fn new(
        tier: ConvergenceTier,
        rounds: Vec<Round>,
        flagged_chunks: Vec<usize>,
        context: BTreeMap<usize, Vec<String>>,
        findings: &[Finding],
        notices: Vec<Notice>,
    ) -> Self {
        let counts: Vec<usize> = rounds.iter().map(Round::failing_count).collect();
        let last = rounds.last();

        Self {
            generated_at: Utc::now(),
            tier,
            final_verdict: last.map(|r| r.verdict),
            halt_reason: last.and_then(|r| r.halt_reason),
            trend: TrendSummary::from_counts(&counts),
            rounds,
            flagged_chunks,
            context,
            summary: FindingSummary::from_findings(findings),
            notices,
        }
    }
}

/// Generate the JSON document for a run: report plus final findings.
pub fn generate_json_report(result: &RunResult) -> Result<String> {
    serde_json::to_string_pretty(result).map_err(Into::into)
}

/// Write the JSON document to a file.
pub fn write_json_report(result: &RunResult, path: &Path) -> Result<()> {
    let content = generate_json_report(result)?;

    let mut file = std::fs::File::create(path)?;
    file.write_all(content.as_bytes())?;

    Ok(())
}

/// Generate a plain-text summary of a run.
pub fn generate_summary_text(result: &RunResult) -> String {
    let report = &result.report;
    let summary = &report.summary;
    let mut lines = Vec::new();

    lines.push(format!(
        "Tier: {} (max {} retry rounds) - {}",
        report.tier.name, report.tier.max_rounds, report.tier.reason
    ));
    lines.push(format!("Rounds: {}", report.rounds.len()));

    let verdict = match (report.final_verdict, report.halt_reason) {
        (Some(verdict), Some(reason)) => format!("{} ({})", verdict, reason),
        (Some(verdict), None) => verdict.to_string(),
        (None, _) => "no rounds ingested".to_string(),
    };
    lines.push(format!("Verdict: {}", verdict));
    if !report.rounds.is_empty() {
        lines.push(format!("Failing chunks per round: {}", report.trend));
    }

    if !report.flagged_chunks.is_empty() {
        let flagged: Vec<String> = report.flagged_chunks.iter().map(|c| c.to_string()).collect();
        lines.push(format!("Flagged for retry: {}", flagged.join(", ")));
        for (chunk, files) in &report.context {
            lines.push(format!("- chunk {} context: {}", chunk, files.join(", ")));
        }
    }

    lines.push(String::new());
    lines.push(format!("Total Findings: {}", summary.total));
    lines.push(format!(
        "- P1: {} | P2: {} | P3: {}",
        summary.p1, summary.p2, summary.p3
    ));
    lines.push(format!(
        "- Questions: {} | Nits: {} | With evidence: {}",
        summary.questions, summary.nits, summary.with_evidence
    ));

    if !summary.by_producer.is_empty() {
        lines.push(String::new());
        lines.push("By Producer:".to_string());

        let mut producers: Vec<_> = summary.by_producer.iter().collect();
        producers.sort_by_key(|(_, count)| std::cmp::Reverse(*count));

        for (producer, count) in producers {
            lines.push(format!("- {}: {}", producer, count));
        }
    }

    let top = most_flagged_files(&result.findings, 3);
    if !top.is_empty() {
        lines.push(String::new());
        lines.push("Most Flagged Files:".to_string());
        for (file, count) in top {
            lines.push(format!("- {}: {}", file, count));
        }
    }

    if !report.notices.is_empty() {
        lines.push(String::new());
        lines.push(format!("Notices: {}", report.notices.len()));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::convergence::{ChunkOutcome, TrendDirection};
    use crate::analysis::tier::TierName;
    use crate::models::{Interaction, Location, NoticeKind, Producer, Severity};
    use tempfile::TempDir;

    fn round(index: usize, failing: Vec<usize>, verdict: Verdict) -> Round {
        Round {
            index,
            chunk_metrics: failing.iter().map(|c| ChunkOutcome::missing(*c)).collect(),
            failing_chunks: failing,
            verdict,
            halt_reason: None,
            timestamp: Utc::now(),
        }
    }

    fn create_test_result() -> RunResult {
        let findings = vec![
            Finding {
                id: "SEC-001".to_string(),
                severity: Severity::P1,
                interaction: Interaction::None,
                location: Location {
                    file: "src/auth.rs".to_string(),
                    line: 12,
                },
                title: "Token logged".to_string(),
                evidence: Some("info!(\"{}\", token)".to_string()),
                confidence: 0.9,
                producer: Producer::from_name("security"),
                also_flagged_by: vec![Producer::from_name("style")],
                round: 1,
                origin_chunk: Some(0),
            },
            Finding {
                id: "STY-002".to_string(),
                severity: Severity::P3,
                interaction: Interaction::Nit,
                location: Location {
                    file: "src/auth.rs".to_string(),
                    line: 40,
                },
                title: "Long line".to_string(),
                evidence: None,
                confidence: 0.5,
                producer: Producer::from_name("style"),
                also_flagged_by: Vec::new(),
                round: 0,
                origin_chunk: Some(0),
            },
        ];

        let report = ConvergenceReport::new(
            ConvergenceTier::new(TierName::Standard, "30 files, no high-risk signals"),
            vec![round(0, vec![1, 2], Verdict::Retry), round(1, vec![], Verdict::Converged)],
            Vec::new(),
            BTreeMap::new(),
            &findings,
            vec![Notice::new(NoticeKind::ChunkTooSmall, "chunk 3 auto-passed").in_round(0)],
        );

        RunResult { report, findings }
    }

    #[test]
    fn test_report_record() {
        let result = create_test_result();
        let report = &result.report;
        assert_eq!(report.final_verdict, Some(Verdict::Converged));
        assert_eq!(report.trend.failing_counts, vec![2, 0]);
        assert_eq!(report.trend.direction, TrendDirection::Improving);
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.p1, 1);
    }

    #[test]
    fn test_generate_summary_text() {
        let text = generate_summary_text(&create_test_result());

        assert!(text.contains("Tier: STANDARD"));
        assert!(text.contains("Verdict: converged"));
        assert!(text.contains("2 -> 0 (Improving)"));
        assert!(text.contains("Total Findings: 2"));
        assert!(text.contains("- src/auth.rs: 2"));
        assert!(text.contains("Notices: 1"));
    }

    #[test]
    fn test_generate_json_report() {
        let result = create_test_result();
        let json = generate_json_report(&result).unwrap();

        assert!(json.contains("\"final_verdict\": \"converged\""));
        assert!(json.contains("\"also_flagged_by\""));
        assert!(json.contains("\"chunk_too_small\""));

        let parsed: RunResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.findings, result.findings);
    }

    #[test]
    fn test_write_json_report() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("review_converge.json");
        write_json_report(&create_test_result(), &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"tier\""));
    }
}
