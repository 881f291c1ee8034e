//! Data models for the review aggregation core.
//!
//! This module contains the core data structures shared by every stage of
//! the pipeline: findings and their producers, the changeset under review,
//! and the notices that record degraded decisions.

use crate::error::AggregationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Severity level of a finding. `P1` is the most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Minor issue, suggestion-level.
    P3,
    /// Real defect that should be fixed.
    P2,
    /// Blocking defect: security hole, data loss, crash.
    P1,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::P1 => write!(f, "P1"),
            Severity::P2 => write!(f, "P2"),
            Severity::P3 => write!(f, "P3"),
        }
    }
}

impl Severity {
    /// The lowest severity, used whenever a tag cannot be understood.
    pub const LOWEST: Severity = Severity::P3;

    /// Parse a severity tag such as `P1`, `p2` or `[P3]`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().trim_matches(|c| c == '[' || c == ']').to_uppercase().as_str() {
            "P1" => Some(Severity::P1),
            "P2" => Some(Severity::P2),
            "P3" => Some(Severity::P3),
            _ => None,
        }
    }
}

/// Interaction tag of a finding, orthogonal to severity.
///
/// Anything other than `None` marks the finding as non-assertive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interaction {
    #[default]
    None,
    Question,
    Nit,
}

impl fmt::Display for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interaction::None => write!(f, "none"),
            Interaction::Question => write!(f, "question"),
            Interaction::Nit => write!(f, "nit"),
        }
    }
}

impl Interaction {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "question" | "q" => Some(Interaction::Question),
            "nit" | "nitpick" => Some(Interaction::Nit),
            "none" => Some(Interaction::None),
            _ => None,
        }
    }
}

/// Review categories shipped with the tool, in fixed priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BuiltinProducer {
    Security,
    Correctness,
    Performance,
    Architecture,
    Testing,
    Maintainability,
    Style,
    Documentation,
    /// Cross-agent claim challenges. Never suppressed by dedup.
    Challenge,
}

impl BuiltinProducer {
    /// All built-ins, highest priority first.
    pub const ALL: [BuiltinProducer; 9] = [
        BuiltinProducer::Security,
        BuiltinProducer::Correctness,
        BuiltinProducer::Performance,
        BuiltinProducer::Architecture,
        BuiltinProducer::Testing,
        BuiltinProducer::Maintainability,
        BuiltinProducer::Style,
        BuiltinProducer::Documentation,
        BuiltinProducer::Challenge,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinProducer::Security => "security",
            BuiltinProducer::Correctness => "correctness",
            BuiltinProducer::Performance => "performance",
            BuiltinProducer::Architecture => "architecture",
            BuiltinProducer::Testing => "testing",
            BuiltinProducer::Maintainability => "maintainability",
            BuiltinProducer::Style => "style",
            BuiltinProducer::Documentation => "documentation",
            BuiltinProducer::Challenge => "challenge",
        }
    }

    /// Reserved finding-id prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            BuiltinProducer::Security => "SEC",
            BuiltinProducer::Correctness => "COR",
            BuiltinProducer::Performance => "PERF",
            BuiltinProducer::Architecture => "ARCH",
            BuiltinProducer::Testing => "TEST",
            BuiltinProducer::Maintainability => "MAINT",
            BuiltinProducer::Style => "STY",
            BuiltinProducer::Documentation => "DOC",
            BuiltinProducer::Challenge => "CHAL",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }
}

/// Identifier of the worker category that emitted a finding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Producer {
    Builtin(BuiltinProducer),
    Custom(String),
}

impl Producer {
    /// Build a producer from a worker name. Names are case-insensitive.
    pub fn from_name(name: &str) -> Self {
        let normalized = name.trim().to_lowercase();
        match BuiltinProducer::from_name(&normalized) {
            Some(builtin) => Producer::Builtin(builtin),
            None => Producer::Custom(normalized),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Producer::Builtin(b) => b.name(),
            Producer::Custom(name) => name,
        }
    }

    /// Whether findings from this producer bypass dedup suppression.
    pub fn is_exempt(&self) -> bool {
        matches!(self, Producer::Builtin(BuiltinProducer::Challenge))
    }
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<String> for Producer {
    fn from(s: String) -> Self {
        Producer::from_name(&s)
    }
}

impl From<Producer> for String {
    fn from(p: Producer) -> Self {
        p.name().to_string()
    }
}

/// Where a finding points: a file and a 1-indexed line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A single reported issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Stable id: producer prefix + sequence number, e.g. `SEC-004`.
    pub id: String,
    pub severity: Severity,
    #[serde(default)]
    pub interaction: Interaction,
    pub location: Location,
    /// Short title describing the finding.
    #[serde(default)]
    pub title: String,
    /// Verifiable excerpt of the reviewed artifact, if the worker attached one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f64,
    pub producer: Producer,
    /// Other producers that reported an equivalent finding.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_flagged_by: Vec<Producer>,
    /// Round in which the finding was reported.
    #[serde(default)]
    pub round: usize,
    /// Chunk whose reviewer reported the finding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_chunk: Option<usize>,
}

impl Finding {
    pub fn has_evidence(&self) -> bool {
        self.evidence.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    /// Assertions are findings without an interaction tag.
    pub fn is_assertion(&self) -> bool {
        self.interaction == Interaction::None
    }

    /// Record another producer as having flagged the same thing.
    pub fn absorb(&mut self, other: &Finding) {
        let incoming = std::iter::once(&other.producer).chain(other.also_flagged_by.iter());
        for producer in incoming {
            if *producer != self.producer && !self.also_flagged_by.contains(producer) {
                self.also_flagged_by.push(producer.clone());
            }
        }
    }
}

/// Summary of findings in a result set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindingSummary {
    /// Total number of findings.
    pub total: usize,
    pub p1: usize,
    pub p2: usize,
    pub p3: usize,
    /// Findings tagged `question`.
    pub questions: usize,
    /// Findings tagged `nit`.
    pub nits: usize,
    /// Findings with an evidence excerpt.
    pub with_evidence: usize,
    /// Findings grouped by producer.
    pub by_producer: BTreeMap<String, usize>,
}

impl FindingSummary {
    /// Creates a summary from a list of findings.
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut summary = Self {
            total: findings.len(),
            ..Self::default()
        };

        for finding in findings {
            match finding.severity {
                Severity::P1 => summary.p1 += 1,
                Severity::P2 => summary.p2 += 1,
                Severity::P3 => summary.p3 += 1,
            }
            match finding.interaction {
                Interaction::Question => summary.questions += 1,
                Interaction::Nit => summary.nits += 1,
                Interaction::None => {}
            }
            if finding.has_evidence() {
                summary.with_evidence += 1;
            }

            *summary
                .by_producer
                .entry(finding.producer.name().to_string())
                .or_insert(0) += 1;
        }

        summary
    }
}

/// Category of a degraded or defaulted decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    ParseFailure,
    SeverityDefaulted,
    ConfidenceClamped,
    ThresholdDefaulted,
    UnknownThresholdKey,
    TierOverrideIgnored,
    HierarchyEntryIgnored,
    ProducerAutoAppended,
    UnknownProducer,
    CustomPrefixRejected,
    ChunkTooSmall,
    ChunkEmpty,
    ChunkNotScored,
    ChangesetSignalDefaulted,
    ContextReferenceRejected,
    ConfigValueAdjusted,
}

/// A degraded, defaulted or skipped decision, surfaced in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<usize>,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            round: None,
            message: message.into(),
        }
    }

    pub fn in_round(mut self, round: usize) -> Self {
        self.round = Some(round);
        self
    }
}

/// Per-file signals supplied by the external file-scoring collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSignal {
    pub path: String,
    #[serde(default)]
    pub risk_factor: Option<f64>,
    #[serde(default)]
    pub complexity: Option<f64>,
    /// Import/reference targets as written in the file.
    #[serde(default)]
    pub references: Vec<String>,
}

/// Chunk partition as supplied by the external chunking collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub index: usize,
    pub files: Vec<String>,
}

/// Raw changeset description (input JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Changeset {
    #[serde(default)]
    pub files: Vec<FileSignal>,
    #[serde(default)]
    pub chunks: Vec<ChunkSpec>,
}

/// Whether a chunk is mostly source code or mostly documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Code,
    Doc,
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkType::Code => write!(f, "code"),
            ChunkType::Doc => write!(f, "doc"),
        }
    }
}

/// A file under review with validated signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetFile {
    pub path: String,
    pub risk_factor: f64,
    pub complexity: f64,
    pub references: Vec<String>,
}

/// A disjoint subset of files reviewed together. Membership is fixed per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub files: Vec<String>,
    pub aggregate_complexity: f64,
    pub chunk_type: ChunkType,
}

/// The validated changeset: files with signals plus the chunk partition.
#[derive(Debug, Clone, Default)]
pub struct ResolvedChangeset {
    pub files: BTreeMap<String, ChangesetFile>,
    pub chunks: Vec<Chunk>,
    owner: HashMap<String, usize>,
}

const DEFAULT_SIGNAL: f64 = 1.0;

impl Changeset {
    /// Validate the changeset and derive chunk types.
    ///
    /// Overlapping chunk membership and duplicate chunk indices are fatal;
    /// missing or non-finite signals fall back to `1.0` with a notice.
    pub fn resolve(
        &self,
        source_extensions: &[String],
    ) -> Result<(ResolvedChangeset, Vec<Notice>), AggregationError> {
        let mut notices = Vec::new();
        let mut files: BTreeMap<String, ChangesetFile> = BTreeMap::new();

        for signal in &self.files {
            let path = signal.path.trim().to_string();
            if path.is_empty() {
                continue;
            }
            let risk_factor = sanitize_signal(signal.risk_factor, &path, "risk_factor", &mut notices);
            let complexity = sanitize_signal(signal.complexity, &path, "complexity", &mut notices);
            files.insert(
                path.clone(),
                ChangesetFile {
                    path,
                    risk_factor,
                    complexity,
                    references: signal.references.clone(),
                },
            );
        }

        let mut seen_indices = BTreeSet::new();
        let mut owner: HashMap<String, usize> = HashMap::new();
        let mut chunks = Vec::with_capacity(self.chunks.len());

        for spec in &self.chunks {
            if !seen_indices.insert(spec.index) {
                return Err(AggregationError::InvalidChangeset(format!(
                    "duplicate chunk index {}",
                    spec.index
                )));
            }

            let mut chunk_files = Vec::with_capacity(spec.files.len());
            for raw in &spec.files {
                let path = raw.trim().to_string();
                if let Some(previous) = owner.insert(path.clone(), spec.index) {
                    return Err(AggregationError::InvalidChangeset(format!(
                        "file {} belongs to chunks {} and {}",
                        path, previous, spec.index
                    )));
                }
                if !files.contains_key(&path) {
                    notices.push(Notice::new(
                        NoticeKind::ChangesetSignalDefaulted,
                        format!("{} has no file signals; using defaults", path),
                    ));
                    files.insert(
                        path.clone(),
                        ChangesetFile {
                            path: path.clone(),
                            risk_factor: DEFAULT_SIGNAL,
                            complexity: DEFAULT_SIGNAL,
                            references: Vec::new(),
                        },
                    );
                }
                chunk_files.push(path);
            }

            let aggregate_complexity = chunk_files
                .iter()
                .filter_map(|p| files.get(p))
                .map(|f| f.complexity)
                .sum();
            let chunk_type = classify_chunk(&chunk_files, source_extensions);

            chunks.push(Chunk {
                index: spec.index,
                files: chunk_files,
                aggregate_complexity,
                chunk_type,
            });
        }

        chunks.sort_by_key(|c| c.index);

        Ok((
            ResolvedChangeset {
                files,
                chunks,
                owner,
            },
            notices,
        ))
    }
}

fn sanitize_signal(value: Option<f64>, path: &str, field: &str, notices: &mut Vec<Notice>) -> f64 {
    match value {
        Some(v) if v.is_finite() && v >= 0.0 => v,
        Some(v) => {
            notices.push(Notice::new(
                NoticeKind::ChangesetSignalDefaulted,
                format!("{} has invalid {} {}; using {}", path, field, v, DEFAULT_SIGNAL),
            ));
            DEFAULT_SIGNAL
        }
        None => DEFAULT_SIGNAL,
    }
}

/// Whether a path has one of the configured source-code extensions.
pub fn is_source_file(path: &str, source_extensions: &[String]) -> bool {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            source_extensions
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// A chunk is `Code` when strictly more than half of its files are source files.
pub fn classify_chunk(files: &[String], source_extensions: &[String]) -> ChunkType {
    let source = files
        .iter()
        .filter(|f| is_source_file(f, source_extensions))
        .count();
    if source * 2 > files.len() {
        ChunkType::Code
    } else {
        ChunkType::Doc
    }
}

impl ResolvedChangeset {
    /// Chunk that owns `path`, if any.
    pub fn chunk_of(&self, path: &str) -> Option<usize> {
        self.owner.get(path).copied()
    }

    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.index == index)
    }

    pub fn chunk_indices(&self) -> Vec<usize> {
        self.chunks.iter().map(|c| c.index).collect()
    }

    /// Number of files that belong to some chunk.
    pub fn file_count(&self) -> usize {
        self.owner.len()
    }

    /// Signals for every chunked file.
    pub fn chunked_files(&self) -> impl Iterator<Item = &ChangesetFile> {
        self.chunks
            .iter()
            .flat_map(|c| c.files.iter())
            .filter_map(|p| self.files.get(p))
    }
}
