//! Per-chunk quality metrics and the threshold gate.
//!
//! Scoring is pure: the same chunk and findings always produce the same
//! metrics. Degenerate chunks (no files, or too few files to judge) pass
//! automatically and carry a note saying why.

use crate::config::ScoringConfig;
use crate::models::{Chunk, ChunkType, Finding, Notice, NoticeKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};

/// Chunks with fewer files than this auto-pass.
pub const MIN_SAMPLE_FILES: usize = 3;

const EPSILON: f64 = 1e-9;

/// The four orthogonal quality metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    FindingDensity,
    EvidenceRatio,
    ConfidenceMean,
    CoverageCompleteness,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::FindingDensity,
        Metric::EvidenceRatio,
        Metric::ConfidenceMean,
        Metric::CoverageCompleteness,
    ];

    /// Config key for this metric.
    pub fn key(&self) -> &'static str {
        match self {
            Metric::FindingDensity => "finding_density",
            Metric::EvidenceRatio => "evidence_ratio",
            Metric::ConfidenceMean => "confidence_mean",
            Metric::CoverageCompleteness => "coverage_completeness",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.key() == key)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Minimum values a chunk must reach on each metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub finding_density: f64,
    pub evidence_ratio: f64,
    pub confidence_mean: f64,
    pub coverage_completeness: f64,
}

impl Thresholds {
    pub fn code_defaults() -> Self {
        Self {
            finding_density: 0.2,
            evidence_ratio: 0.6,
            confidence_mean: 0.6,
            coverage_completeness: 0.4,
        }
    }

    pub fn doc_defaults() -> Self {
        Self {
            finding_density: 0.1,
            evidence_ratio: 0.3,
            confidence_mean: 0.5,
            coverage_completeness: 0.2,
        }
    }

    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::FindingDensity => self.finding_density,
            Metric::EvidenceRatio => self.evidence_ratio,
            Metric::ConfidenceMean => self.confidence_mean,
            Metric::CoverageCompleteness => self.coverage_completeness,
        }
    }

    fn set(&mut self, metric: Metric, value: f64) {
        match metric {
            Metric::FindingDensity => self.finding_density = value,
            Metric::EvidenceRatio => self.evidence_ratio = value,
            Metric::ConfidenceMean => self.confidence_mean = value,
            Metric::CoverageCompleteness => self.coverage_completeness = value,
        }
    }

    pub fn to_toml_table(&self) -> BTreeMap<String, toml::Value> {
        Metric::ALL
            .into_iter()
            .map(|m| (m.key().to_string(), toml::Value::Float(self.get(m))))
            .collect()
    }

    /// Apply raw overrides on top of `defaults`.
    ///
    /// Non-numeric, non-finite and out-of-range values keep the default.
    /// Every accepted value is clamped to `[0, 1]` before use.
    pub fn resolve(
        profile: ChunkType,
        defaults: Thresholds,
        overrides: &BTreeMap<String, toml::Value>,
        notices: &mut Vec<Notice>,
    ) -> Self {
        let mut resolved = defaults;

        for (key, raw) in overrides {
            let Some(metric) = Metric::from_key(key) else {
                warn!("Ignoring unknown {} threshold key '{}'", profile, key);
                notices.push(Notice::new(
                    NoticeKind::UnknownThresholdKey,
                    format!("unknown {} threshold '{}' ignored", profile, key),
                ));
                continue;
            };

            let value = match raw {
                toml::Value::Float(f) => Some(*f),
                toml::Value::Integer(i) => Some(*i as f64),
                _ => None,
            };

            match value {
                Some(v) if v.is_finite() && (0.0..=1.0).contains(&v) => {
                    resolved.set(metric, v.clamp(0.0, 1.0));
                }
                _ => {
                    let default = defaults.get(metric);
                    warn!(
                        "Invalid {} threshold {} = {}; using default {}",
                        profile, key, raw, default
                    );
                    notices.push(Notice::new(
                        NoticeKind::ThresholdDefaulted,
                        format!(
                            "{} threshold {} = {} is not a number in [0,1]; using default {}",
                            profile, key, raw, default
                        ),
                    ));
                }
            }
        }

        resolved
    }
}

/// Threshold profiles for code and documentation chunks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdProfiles {
    pub code: Thresholds,
    pub doc: Thresholds,
}

impl Default for ThresholdProfiles {
    fn default() -> Self {
        Self {
            code: Thresholds::code_defaults(),
            doc: Thresholds::doc_defaults(),
        }
    }
}

impl ThresholdProfiles {
    pub fn from_config(config: &ScoringConfig) -> (Self, Vec<Notice>) {
        let mut notices = Vec::new();
        let profiles = Self {
            code: Thresholds::resolve(
                ChunkType::Code,
                Thresholds::code_defaults(),
                &config.code,
                &mut notices,
            ),
            doc: Thresholds::resolve(
                ChunkType::Doc,
                Thresholds::doc_defaults(),
                &config.doc,
                &mut notices,
            ),
        };
        (profiles, notices)
    }

    pub fn for_type(&self, chunk_type: ChunkType) -> &Thresholds {
        match chunk_type {
            ChunkType::Code => &self.code,
            ChunkType::Doc => &self.doc,
        }
    }
}

/// Why a chunk passed without being judged on its metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoreNote {
    /// The chunk has no files at all.
    EmptyChunk,
    /// The chunk has too few files for the metrics to mean anything.
    TooSmall { files: usize },
}

impl fmt::Display for ScoreNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreNote::EmptyChunk => write!(f, "degenerate: chunk has no files"),
            ScoreNote::TooSmall { files } => write!(
                f,
                "too small: {} file(s), fewer than {} needed to judge",
                files, MIN_SAMPLE_FILES
            ),
        }
    }
}

/// Quality metrics for one chunk in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub chunk: usize,
    pub chunk_type: ChunkType,
    pub files: usize,
    pub findings: usize,
    pub finding_density: f64,
    pub evidence_ratio: f64,
    pub confidence_mean: f64,
    pub coverage_completeness: f64,
    pub pass: bool,
    /// Metrics that missed their threshold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<Metric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<ScoreNote>,
}

impl QualityMetrics {
    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::FindingDensity => self.finding_density,
            Metric::EvidenceRatio => self.evidence_ratio,
            Metric::ConfidenceMean => self.confidence_mean,
            Metric::CoverageCompleteness => self.coverage_completeness,
        }
    }
}

/// Compute quality metrics for a chunk from the findings attributed to it.
pub fn score(chunk: &Chunk, findings: &[Finding], profiles: &ThresholdProfiles) -> QualityMetrics {
    let files = chunk.files.len();
    let total = findings.len();

    let with_evidence = findings.iter().filter(|f| f.has_evidence()).count();
    let confidence_mean = if total == 0 {
        1.0
    } else {
        findings.iter().map(|f| f.confidence).sum::<f64>() / total as f64
    };

    let chunk_files: BTreeSet<&str> = chunk.files.iter().map(String::as_str).collect();
    let covered = findings
        .iter()
        .map(|f| f.location.file.as_str())
        .filter(|file| chunk_files.contains(file))
        .collect::<BTreeSet<_>>()
        .len();

    let (finding_density, coverage_completeness) = if files == 0 {
        (0.0, 0.0)
    } else {
        (total as f64 / files as f64, covered as f64 / files as f64)
    };

    let mut metrics = QualityMetrics {
        chunk: chunk.index,
        chunk_type: chunk.chunk_type,
        files,
        findings: total,
        finding_density,
        evidence_ratio: with_evidence as f64 / total.max(1) as f64,
        confidence_mean,
        coverage_completeness,
        pass: true,
        failed: Vec::new(),
        note: None,
    };

    if files == 0 {
        metrics.note = Some(ScoreNote::EmptyChunk);
        debug!("Chunk {} is empty; auto-pass", chunk.index);
        return metrics;
    }

    if files < MIN_SAMPLE_FILES {
        metrics.note = Some(ScoreNote::TooSmall { files });
        debug!("Chunk {} has {} file(s); auto-pass", chunk.index, files);
        return metrics;
    }

    let thresholds = profiles.for_type(chunk.chunk_type);
    metrics.failed = Metric::ALL
        .into_iter()
        .filter(|m| metrics.value(*m) + EPSILON < thresholds.get(*m))
        .collect();
    metrics.pass = metrics.failed.is_empty();

    debug!(
        "Chunk {} ({}): density={:.2} evidence={:.2} confidence={:.2} coverage={:.2} pass={}",
        chunk.index,
        chunk.chunk_type,
        metrics.finding_density,
        metrics.evidence_ratio,
        metrics.confidence_mean,
        metrics.coverage_completeness,
        metrics.pass
    );

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Interaction, Location, Producer, Severity};

    fn chunk(files: &[&str], chunk_type: ChunkType) -> Chunk {
        Chunk {
            index: 0,
            files: files.iter().map(|f| f.to_string()).collect(),
            aggregate_complexity: files.len() as f64,
            chunk_type,
        }
    }

    fn finding(file: &str, evidence: bool, confidence: f64) -> Finding {
        Finding {
            id: "COR-001".to_string(),
            severity: Severity::P2,
            interaction: Interaction::None,
            location: Location {
                file: file.to_string(),
                line: 1,
            },
            title: "t".to_string(),
            evidence: evidence.then(|| "let x = 1;".to_string()),
            confidence,
            producer: Producer::from_name("correctness"),
            also_flagged_by: Vec::new(),
            round: 0,
            origin_chunk: Some(0),
        }
    }

    #[test]
    fn test_empty_chunk_auto_passes() {
        let metrics = score(&chunk(&[], ChunkType::Code), &[], &ThresholdProfiles::default());
        assert!(metrics.pass);
        assert_eq!(metrics.note, Some(ScoreNote::EmptyChunk));
        assert!(metrics.finding_density.is_finite());
        assert!(metrics.coverage_completeness.is_finite());
        assert_eq!(metrics.confidence_mean, 1.0);
    }

    #[test]
    fn test_small_chunk_auto_passes_regardless_of_findings() {
        let c = chunk(&["a.rs", "b.rs"], ChunkType::Code);
        let findings = vec![finding("a.rs", false, 0.0)];
        let metrics = score(&c, &findings, &ThresholdProfiles::default());
        assert!(metrics.pass);
        assert_eq!(metrics.note, Some(ScoreNote::TooSmall { files: 2 }));
    }

    #[test]
    fn test_zero_findings_confidence_is_one() {
        let c = chunk(&["a.rs", "b.rs", "c.rs"], ChunkType::Code);
        let metrics = score(&c, &[], &ThresholdProfiles::default());
        assert_eq!(metrics.confidence_mean, 1.0);
        assert_eq!(metrics.evidence_ratio, 0.0);
        assert!(!metrics.pass);
    }

    #[test]
    fn test_metrics_values() {
        let c = chunk(&["a.rs", "b.rs", "c.rs", "d.rs"], ChunkType::Code);
        let findings = vec![
            finding("a.rs", true, 0.9),
            finding("a.rs", true, 0.7),
            finding("b.rs", false, 0.8),
        ];
        let metrics = score(&c, &findings, &ThresholdProfiles::default());

        assert_eq!(metrics.finding_density, 0.75);
        assert!((metrics.evidence_ratio - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.confidence_mean - 0.8).abs() < 1e-9);
        assert_eq!(metrics.coverage_completeness, 0.5);
        assert!(metrics.pass);
    }

    #[test]
    fn test_coverage_failure_flags_metric() {
        let c = chunk(&["a.rs", "b.rs", "c.rs", "d.rs", "e.rs"], ChunkType::Code);
        let findings = vec![finding("a.rs", true, 0.9), finding("a.rs", true, 0.9)];
        let metrics = score(&c, &findings, &ThresholdProfiles::default());

        assert_eq!(metrics.coverage_completeness, 0.2);
        assert!(!metrics.pass);
        assert_eq!(metrics.failed, vec![Metric::CoverageCompleteness]);
    }

    #[test]
    fn test_doc_thresholds_are_looser() {
        let c = chunk(&["a.md", "b.md", "c.md", "d.md", "e.md"], ChunkType::Doc);
        let findings = vec![finding("a.md", true, 0.9)];
        let metrics = score(&c, &findings, &ThresholdProfiles::default());
        assert!(metrics.pass);

        let code = Thresholds::code_defaults();
        let doc = Thresholds::doc_defaults();
        for metric in Metric::ALL {
            assert!(code.get(metric) >= doc.get(metric));
        }
    }

    #[test]
    fn test_threshold_overrides_validated() {
        let mut overrides = BTreeMap::new();
        overrides.insert("coverage_completeness".to_string(), toml::Value::Float(0.7));
        overrides.insert("evidence_ratio".to_string(), toml::Value::Float(1.5));
        overrides.insert(
            "confidence_mean".to_string(),
            toml::Value::String("high".to_string()),
        );
        overrides.insert("finding_density".to_string(), toml::Value::Integer(1));
        overrides.insert("vibes".to_string(), toml::Value::Float(0.1));

        let mut notices = Vec::new();
        let resolved = Thresholds::resolve(
            ChunkType::Code,
            Thresholds::code_defaults(),
            &overrides,
            &mut notices,
        );

        assert_eq!(resolved.coverage_completeness, 0.7);
        assert_eq!(resolved.evidence_ratio, 0.6);
        assert_eq!(resolved.confidence_mean, 0.6);
        assert_eq!(resolved.finding_density, 1.0);
        assert_eq!(
            notices.iter().filter(|n| n.kind == NoticeKind::ThresholdDefaulted).count(),
            2
        );
        assert_eq!(
            notices.iter().filter(|n| n.kind == NoticeKind::UnknownThresholdKey).count(),
            1
        );
    }

    #[test]
    fn test_nan_override_keeps_default() {
        let mut overrides = BTreeMap::new();
        overrides.insert("evidence_ratio".to_string(), toml::Value::Float(f64::NAN));
        let mut notices = Vec::new();
        let resolved = Thresholds::resolve(
            ChunkType::Doc,
            Thresholds::doc_defaults(),
            &overrides,
            &mut notices,
        );
        assert_eq!(resolved.evidence_ratio, 0.3);
        assert_eq!(notices.len(), 1);
    }
}
