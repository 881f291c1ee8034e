//! Finding extraction from raw worker output.
//!
//! Workers emit semi-structured text. Two encodings are accepted and may be
//! mixed line by line:
//!
//! - markdown blocks opened by a tagged heading such as
//!   `### [P2] COR-003 Off-by-one in pager`, with optional `Location:`,
//!   `Confidence:` and `Evidence:` lines in the body;
//! - JSON lines carrying `severity`, `file`, `line` and optional fields.
//!
//! Nothing here is fatal. A block that cannot be used is reported as a
//! [`ParseFailure`] and skipped; defaulted values produce a [`Notice`].

use crate::analysis::hierarchy::{derive_prefix, unique_prefix, DedupHierarchy};
use crate::models::{Finding, Interaction, Location, Notice, NoticeKind, Producer, Severity};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Confidence assumed when a worker does not report one.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

static ANY_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s").expect("valid regex literal"));

static FINDING_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#{2,4}\s+((?:\[[^\]\n]*\]\s*)+)(.*)$").expect("valid regex literal")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]\n]*)\]").expect("valid regex literal"));

static FINDING_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z][A-Z0-9]{1,7})-(\d{1,6})$").expect("valid regex literal"));

static LEADING_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\(?([A-Z][A-Z0-9]{1,7}-\d{1,6})\)?(?:\s*[:\-]\s*|\s+|$)").expect("valid regex literal")
});

static LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*[-*]?\s*\**\s*(location|file|confidence|evidence)\s*\**\s*:\s*\**\s*(.*)$")
        .expect("valid regex literal")
});

static LOCATION_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`?([^\s`:'\x22()\[\],]+):(\d+)").expect("valid regex literal"));

/// `path:line` inside free text. Requires an extension so tags and times
/// are not mistaken for locations.
static INLINE_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`?([A-Za-z0-9_@+\-./]*[A-Za-z0-9_@+\-]\.[A-Za-z0-9]+):(\d+)").expect("valid regex literal")
});

static INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("valid regex literal"));

/// One raw document: the output of one producer for one chunk in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub round: usize,
    pub chunk: usize,
    pub producer: Producer,
    pub text: String,
}

impl WorkerOutput {
    pub fn new(round: usize, chunk: usize, producer: Producer, text: impl Into<String>) -> Self {
        Self {
            round,
            chunk,
            producer,
            text: text.into(),
        }
    }
}

/// A block that could not be turned into a finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseFailure {
    pub round: usize,
    pub chunk: usize,
    pub producer: Producer,
    /// 1-indexed line in the worker document where the block starts.
    pub line: usize,
    pub reason: String,
}

impl ParseFailure {
    pub fn to_notice(&self) -> Notice {
        Notice::new(
            NoticeKind::ParseFailure,
            format!(
                "{} output for chunk {}, line {}: {}",
                self.producer, self.chunk, self.line, self.reason
            ),
        )
        .in_round(self.round)
    }
}

/// Everything extracted from one worker document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub findings: Vec<Finding>,
    pub failures: Vec<ParseFailure>,
    pub notices: Vec<Notice>,
}

impl Extraction {
    /// Parse failures and defaulted-value notices, in that order.
    pub fn all_notices(&self) -> Vec<Notice> {
        self.failures
            .iter()
            .map(ParseFailure::to_notice)
            .chain(self.notices.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RawConfidence {
    Number(f64),
    Unparsed(String),
}

/// A finding as written, before defaults are applied.
#[derive(Debug, Clone, Default)]
struct RawFinding {
    line: usize,
    severity: Option<String>,
    interaction: Interaction,
    id: Option<String>,
    title: String,
    /// Id-shaped token opening the title, with the title that follows it.
    leading_id: Option<(String, String)>,
    location: Option<Location>,
    heading_location: Option<Location>,
    confidence: Option<RawConfidence>,
    evidence: Option<String>,
}

enum Parsed {
    Finding(RawFinding),
    Failure { line: usize, reason: String },
}

impl Parsed {
    fn line(&self) -> usize {
        match self {
            Parsed::Finding(raw) => raw.line,
            Parsed::Failure { line, .. } => *line,
        }
    }
}

/// Turns worker documents into findings.
///
/// Keeps one id sequence per producer and the set of issued ids for the
/// lifetime of a run, so an id is never handed out twice.
#[derive(Debug, Clone, Default)]
pub struct FindingExtractor {
    sequences: HashMap<Producer, usize>,
    issued: HashSet<String>,
    late_prefixes: HashMap<Producer, String>,
}

impl FindingExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extract(&mut self, output: &WorkerOutput, hierarchy: &DedupHierarchy) -> Extraction {
        let mut extraction = Extraction::default();

        for parsed in parse_document(&output.text) {
            match parsed {
                Parsed::Failure { line, reason } => {
                    warn!(
                        "Skipping unparseable {} output in chunk {} (line {}): {}",
                        output.producer, output.chunk, line, reason
                    );
                    extraction.failures.push(ParseFailure {
                        round: output.round,
                        chunk: output.chunk,
                        producer: output.producer.clone(),
                        line,
                        reason,
                    });
                }
                Parsed::Finding(mut raw) => {
                    let Some(location) = raw.location.take().or_else(|| raw.heading_location.take())
                    else {
                        warn!(
                            "Skipping {} finding in chunk {} (line {}): no file:line location",
                            output.producer, output.chunk, raw.line
                        );
                        extraction.failures.push(ParseFailure {
                            round: output.round,
                            chunk: output.chunk,
                            producer: output.producer.clone(),
                            line: raw.line,
                            reason: "finding has no file:line location".to_string(),
                        });
                        continue;
                    };
                    let finding =
                        self.finalize(raw, location, output, hierarchy, &mut extraction.notices);
                    extraction.findings.push(finding);
                }
            }
        }

        debug!(
            "Extracted {} finding(s) from {} output for chunk {} ({} skipped)",
            extraction.findings.len(),
            output.producer,
            output.chunk,
            extraction.failures.len()
        );
        extraction
    }

    fn finalize(
        &mut self,
        raw: RawFinding,
        location: Location,
        output: &WorkerOutput,
        hierarchy: &DedupHierarchy,
        notices: &mut Vec<Notice>,
    ) -> Finding {
        let context = format!("{} finding at {}", output.producer, location);

        let severity = match raw.severity.as_deref() {
            Some(tag) => Severity::from_tag(tag).unwrap_or_else(|| {
                warn!("{}: unrecognized severity '{}', using {}", context, tag, Severity::LOWEST);
                notices.push(
                    Notice::new(
                        NoticeKind::SeverityDefaulted,
                        format!("{}: unrecognized severity '{}', defaulted to {}", context, tag, Severity::LOWEST),
                    )
                    .in_round(output.round),
                );
                Severity::LOWEST
            }),
            None if raw.interaction != Interaction::None => Severity::LOWEST,
            None => {
                warn!("{}: no severity tag, using {}", context, Severity::LOWEST);
                notices.push(
                    Notice::new(
                        NoticeKind::SeverityDefaulted,
                        format!("{}: no severity tag, defaulted to {}", context, Severity::LOWEST),
                    )
                    .in_round(output.round),
                );
                Severity::LOWEST
            }
        };

        let confidence = match raw.confidence {
            None => DEFAULT_CONFIDENCE,
            Some(RawConfidence::Unparsed(text)) => {
                warn!("{}: non-numeric confidence '{}'", context, text);
                notices.push(
                    Notice::new(
                        NoticeKind::ParseFailure,
                        format!(
                            "{}: non-numeric confidence '{}', using {}",
                            context, text, DEFAULT_CONFIDENCE
                        ),
                    )
                    .in_round(output.round),
                );
                DEFAULT_CONFIDENCE
            }
            Some(RawConfidence::Number(value)) if !(0.0..=1.0).contains(&value) => {
                let clamped = value.clamp(0.0, 1.0);
                warn!("{}: confidence {} clamped to {}", context, value, clamped);
                notices.push(
                    Notice::new(
                        NoticeKind::ConfidenceClamped,
                        format!("{}: confidence {} clamped to {}", context, value, clamped),
                    )
                    .in_round(output.round),
                );
                clamped
            }
            Some(RawConfidence::Number(value)) => value,
        };

        let prefix = self.prefix_for(&output.producer, hierarchy);
        let mut explicit = raw.id;
        let mut title = raw.title;
        if let Some((leading, rest)) = raw.leading_id {
            if has_prefix(&leading, &prefix) {
                title = rest;
                explicit.get_or_insert(leading);
            }
        }
        let id = self.assign_id(explicit.as_deref(), &prefix, &output.producer);

        Finding {
            id,
            severity,
            interaction: raw.interaction,
            location,
            title,
            evidence: raw.evidence.filter(|e| !e.trim().is_empty()),
            confidence,
            producer: output.producer.clone(),
            also_flagged_by: Vec::new(),
            round: output.round,
            origin_chunk: Some(output.chunk),
        }
    }

    /// Prefix for a producer. Producers the hierarchy does not know get a
    /// derived prefix that stays fixed for the rest of the run.
    fn prefix_for(&mut self, producer: &Producer, hierarchy: &DedupHierarchy) -> String {
        if hierarchy.contains(producer) {
            return hierarchy.prefix_for(producer);
        }
        if let Some(prefix) = self.late_prefixes.get(producer) {
            return prefix.clone();
        }

        let mut owned = hierarchy.owned_prefixes();
        owned.extend(self.late_prefixes.values().cloned());
        let prefix = unique_prefix(&derive_prefix(producer.name()), &owned);
        self.late_prefixes.insert(producer.clone(), prefix.clone());
        prefix
    }

    /// Keep a well-formed, unused id carrying the producer's prefix,
    /// otherwise generate the next free one in the producer's sequence.
    fn assign_id(&mut self, explicit: Option<&str>, prefix: &str, producer: &Producer) -> String {
        let sequence = self.sequences.entry(producer.clone()).or_insert(0);

        if let Some(id) = explicit {
            match FINDING_ID.captures(id) {
                Some(caps) if &caps[1] == prefix => {
                    if let Ok(number) = caps[2].parse::<usize>() {
                        *sequence = (*sequence).max(number);
                    }
                    if self.issued.insert(id.to_string()) {
                        return id.to_string();
                    }
                    warn!("Id '{}' from {} was already issued this run; assigning a new one", id, producer);
                }
                _ => debug!("Replacing id '{}' from {}: expected prefix {}", id, producer, prefix),
            }
        }

        loop {
            *sequence += 1;
            let id = format!("{}-{:03}", prefix, sequence);
            if self.issued.insert(id.clone()) {
                return id;
            }
        }
    }
}

fn has_prefix(id: &str, prefix: &str) -> bool {
    FINDING_ID.captures(id).is_some_and(|caps| &caps[1] == prefix)
}

fn parse_document(text: &str) -> Vec<Parsed> {
    let mut parsed = Vec::new();
    let mut current: Option<RawFinding> = None;
    let mut in_fence = false;
    let mut fenced_evidence: Option<Vec<String>> = None;
    let mut awaiting_evidence = false;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();

        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            if in_fence {
                in_fence = false;
                if let (Some(raw), Some(lines)) = (current.as_mut(), fenced_evidence.take()) {
                    raw.evidence = Some(lines.join("\n"));
                }
            } else {
                in_fence = true;
                if awaiting_evidence && current.is_some() {
                    fenced_evidence = Some(Vec::new());
                }
            }
            awaiting_evidence = false;
            continue;
        }

        if in_fence {
            if let Some(lines) = fenced_evidence.as_mut() {
                lines.push(line.to_string());
            }
            continue;
        }

        if trimmed.starts_with('{') {
            parsed.push(parse_json_line(trimmed, line_no));
            continue;
        }

        if ANY_HEADING.is_match(line) {
            if let Some(raw) = current.take() {
                parsed.push(Parsed::Finding(raw));
            }
            awaiting_evidence = false;
            if let Some(caps) = FINDING_HEADING.captures(line) {
                current = Some(parse_heading(&caps[1], caps[2].trim(), line_no));
            }
            continue;
        }

        let Some(raw) = current.as_mut() else {
            continue;
        };

        if let Some(caps) = LABEL.captures(line) {
            awaiting_evidence = false;
            let value = caps[2].trim();
            match caps[1].to_lowercase().as_str() {
                "location" | "file" => {
                    if let Some(location) = location_in(&LOCATION_VALUE, value) {
                        raw.location = Some(location);
                    }
                }
                "confidence" => raw.confidence = Some(parse_confidence(value)),
                _ => match INLINE_CODE.captures(value) {
                    Some(code) => raw.evidence = Some(code[1].to_string()),
                    None if value.is_empty() => awaiting_evidence = true,
                    None => {}
                },
            }
        } else if !trimmed.is_empty() {
            awaiting_evidence = false;
        }
    }

    if let (Some(raw), Some(lines)) = (current.as_mut(), fenced_evidence.take()) {
        raw.evidence = Some(lines.join("\n"));
    }
    if let Some(raw) = current.take() {
        parsed.push(Parsed::Finding(raw));
    }

    parsed.sort_by_key(Parsed::line);
    parsed
}

fn parse_heading(tags: &str, rest: &str, line_no: usize) -> RawFinding {
    let mut raw = RawFinding {
        line: line_no,
        ..RawFinding::default()
    };
    let mut unknown_tag: Option<String> = None;

    for caps in TAG.captures_iter(tags) {
        let tag = caps[1].trim();
        if Severity::from_tag(tag).is_some() {
            raw.severity.get_or_insert_with(|| tag.to_string());
        } else if let Some(interaction) = Interaction::from_tag(tag) {
            raw.interaction = interaction;
        } else if FINDING_ID.is_match(tag) {
            raw.id = Some(tag.to_string());
        } else if unknown_tag.is_none() {
            unknown_tag = Some(tag.to_string());
        }
    }
    if raw.severity.is_none() {
        raw.severity = unknown_tag;
    }

    if let Some(caps) = LEADING_ID.captures(rest) {
        raw.leading_id = Some((caps[1].to_string(), rest[caps[0].len()..].trim().to_string()));
    }
    raw.title = rest.trim().to_string();
    raw.heading_location = location_in(&INLINE_LOCATION, rest);
    raw
}

fn parse_json_line(line: &str, line_no: usize) -> Parsed {
    match serde_json::from_str::<Value>(line) {
        Ok(json) if json.is_object() => Parsed::Finding(json_to_raw(&json, line_no)),
        Ok(_) => Parsed::Failure {
            line: line_no,
            reason: "JSON line is not an object".to_string(),
        },
        Err(e) => Parsed::Failure {
            line: line_no,
            reason: format!("invalid JSON: {}", e),
        },
    }
}

fn json_to_raw(json: &Value, line_no: usize) -> RawFinding {
    let file = json["file"].as_str().or_else(|| json["file_path"].as_str());
    let line = json_usize(&json["line"]).or_else(|| json_usize(&json["line_number"]));
    let location = match (file, line) {
        (Some(file), Some(line)) => make_location(file, line),
        _ => None,
    };

    let confidence = match &json["confidence"] {
        Value::Null => None,
        Value::Number(n) => Some(
            n.as_f64()
                .map(RawConfidence::Number)
                .unwrap_or_else(|| RawConfidence::Unparsed(n.to_string())),
        ),
        Value::String(s) => Some(parse_confidence(s)),
        other => Some(RawConfidence::Unparsed(other.to_string())),
    };

    RawFinding {
        line: line_no,
        severity: json["severity"].as_str().map(String::from),
        interaction: json["interaction"]
            .as_str()
            .and_then(Interaction::from_tag)
            .unwrap_or_default(),
        id: json["id"].as_str().map(|s| s.trim().to_string()),
        title: json["title"].as_str().unwrap_or("").trim().to_string(),
        leading_id: None,
        location,
        heading_location: None,
        confidence,
        evidence: json["evidence"].as_str().map(String::from),
    }
}

fn json_usize(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| v as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn location_in(pattern: &Regex, text: &str) -> Option<Location> {
    let caps = pattern.captures(text)?;
    let line = caps[2].parse().ok()?;
    make_location(&caps[1], line)
}

/// Locations are 1-indexed; paths are stored without a leading `./`.
fn make_location(file: &str, line: usize) -> Option<Location> {
    let file = file.trim().trim_matches('`');
    let file = file.strip_prefix("./").unwrap_or(file);
    if file.is_empty() || line == 0 {
        return None;
    }
    Some(Location {
        file: file.to_string(),
        line,
    })
}

fn parse_confidence(value: &str) -> RawConfidence {
    let token = value
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c| c == '`' || c == '*');
    let (number, percent) = match token.strip_suffix('%') {
        Some(n) => (n, true),
        None => (token, false),
    };
    match number.parse::<f64>() {
        Ok(v) if v.is_finite() => RawConfidence::Number(if percent { v / 100.0 } else { v }),
        _ => RawConfidence::Unparsed(value.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(producer: &str, text: &str) -> Extraction {
        let mut extractor = FindingExtractor::new();
        let output = WorkerOutput::new(0, 1, Producer::from_name(producer), text);
        extractor.extract(&output, &DedupHierarchy::default())
    }

    #[test]
    fn test_markdown_block() {
        let text = r#"
# Security review

### [P1] SEC-004 SQL built from user input
Location: src/db/query.rs:42
Confidence: 0.9
Evidence: `format!("SELECT * FROM users WHERE id = {}", id)`

The query string is assembled with format!.
"#;
        let result = extract("security", text);
        assert!(result.failures.is_empty());
        assert!(result.notices.is_empty());
        assert_eq!(result.findings.len(), 1);

        let finding = &result.findings[0];
        assert_eq!(finding.id, "SEC-004");
        assert_eq!(finding.severity, Severity::P1);
        assert_eq!(finding.title, "SQL built from user input");
        assert_eq!(finding.location.to_string(), "src/db/query.rs:42");
        assert_eq!(finding.confidence, 0.9);
        assert!(finding.has_evidence());
        assert_eq!(finding.origin_chunk, Some(1));
    }

    #[test]
    fn test_fenced_evidence_and_bold_labels() {
        let text = r#"
## [P2] Unchecked index
- **Location:** `src/pager.rs:17`
- **Evidence:**
```rust
## not a heading inside a fence
let item = items[page * size];
```
"#;
        let result = extract("correctness", text);
        assert_eq!(result.findings.len(), 1);
        let finding = &result.findings[0];
        assert_eq!(finding.location.file, "src/pager.rs");
        assert_eq!(
            finding.evidence.as_deref(),
            Some("## not a heading inside a fence\nlet item = items[page * size];")
        );
        assert_eq!(finding.id, "COR-001");
    }

    #[test]
    fn test_heading_location_fallback() {
        let result = extract("performance", "### [P3] Quadratic loop in src/sort.rs:88\n");
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].location.line, 88);
        assert!(!result.findings[0].has_evidence());
    }

    #[test]
    fn test_missing_location_rejected() {
        let result = extract("style", "### [P3] Naming is inconsistent\nSome prose.\n");
        assert!(result.findings.is_empty());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].line, 1);
        assert_eq!(result.all_notices()[0].kind, NoticeKind::ParseFailure);
    }

    #[test]
    fn test_unknown_severity_defaults_to_lowest() {
        let result = extract("security", "### [critical] Hardcoded key\nLocation: src/keys.rs:3\n");
        assert_eq!(result.findings[0].severity, Severity::P3);
        assert_eq!(result.notices.len(), 1);
        assert_eq!(result.notices[0].kind, NoticeKind::SeverityDefaulted);
        assert_eq!(result.notices[0].round, Some(0));
    }

    #[test]
    fn test_interaction_without_severity() {
        let text = "## [question] Is this lock needed?\nLocation: src/cache.rs:12\n\
                    ## [P2][nit] Trailing comma\nLocation: src/cache.rs:40\n";
        let result = extract("maintainability", text);
        assert!(result.notices.is_empty());
        assert_eq!(result.findings[0].interaction, Interaction::Question);
        assert_eq!(result.findings[0].severity, Severity::P3);
        assert_eq!(result.findings[1].interaction, Interaction::Nit);
        assert_eq!(result.findings[1].severity, Severity::P2);
    }

    #[test]
    fn test_confidence_handling() {
        let text = "## [P2] A\nLocation: a.rs:1\nConfidence: 1.7\n\
                    ## [P2] B\nLocation: a.rs:9\nConfidence: high\n\
                    ## [P2] C\nLocation: a.rs:20\nConfidence: 85%\n\
                    ## [P2] D\nLocation: a.rs:30\n";
        let result = extract("testing", text);
        let confidences: Vec<f64> = result.findings.iter().map(|f| f.confidence).collect();
        assert_eq!(confidences, vec![1.0, 0.5, 0.85, 0.5]);
        let kinds: Vec<NoticeKind> = result.notices.iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec![NoticeKind::ConfidenceClamped, NoticeKind::ParseFailure]);
    }

    #[test]
    fn test_json_lines() {
        let text = r#"Findings follow.
{"severity": "P1", "file": "src/auth.rs", "line": 7, "title": "Token logged", "confidence": 0.95, "evidence": "info!(\"token={}\", token)"}
{"severity": "P3", "file_path": "./README.md", "line_number": "3", "interaction": "nit"}
{"severity": "P2", "title": "no location"}
{not json
"#;
        let result = extract("security", text);
        assert_eq!(result.findings.len(), 2);
        assert_eq!(result.findings[0].severity, Severity::P1);
        assert!(result.findings[0].has_evidence());
        assert_eq!(result.findings[1].location.file, "README.md");
        assert_eq!(result.findings[1].interaction, Interaction::Nit);
        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.failures[0].line, 4);
    }

    #[test]
    fn test_foreign_ids_replaced_and_sequence_continues() {
        let mut extractor = FindingExtractor::new();
        let h = DedupHierarchy::default();
        let producer = Producer::from_name("style");

        let first = WorkerOutput::new(
            0,
            0,
            producer.clone(),
            "## [P3] STY-007 Long line\nLocation: a.rs:1\n## [P3] SEC-001 Mislabelled\nLocation: a.rs:9\n",
        );
        let ids: Vec<String> = extractor
            .extract(&first, &h)
            .findings
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec!["STY-007", "STY-008"]);

        let second = WorkerOutput::new(1, 0, producer, "## [P3] Tabs\nLocation: b.rs:2\n");
        let result = extractor.extract(&second, &h);
        assert_eq!(result.findings[0].id, "STY-009");
        assert_eq!(result.findings[0].round, 1);
    }

    #[test]
    fn test_ids_unique_across_chunks() {
        let mut extractor = FindingExtractor::new();
        let h = DedupHierarchy::default();
        let security = Producer::from_name("security");

        let mut ids = Vec::new();
        for (chunk, text) in [
            (0, "## [P1] Leak\nLocation: a.rs:1\n"),
            (1, "## [P2] SEC-001 Other\nLocation: b.rs:2\n"),
            (2, "## [P2] SEC-004 First\nLocation: c.rs:3\n"),
            (3, "## [P2] SEC-004 Second\nLocation: d.rs:4\n"),
        ] {
            let output = WorkerOutput::new(0, chunk, security.clone(), text);
            ids.extend(extractor.extract(&output, &h).findings.into_iter().map(|f| f.id));
        }
        assert_eq!(ids, vec!["SEC-001", "SEC-002", "SEC-004", "SEC-005"]);
    }

    #[test]
    fn test_title_keeps_tokens_that_are_not_ids() {
        let result = extract("correctness", "### [P2] UTF-8 decoding panics\nLocation: src/text.rs:5\n");
        assert_eq!(result.findings[0].title, "UTF-8 decoding panics");
        assert_eq!(result.findings[0].id, "COR-001");

        let result = extract("correctness", "### [P2] COR-012: Double free\nLocation: src/mem.rs:5\n");
        assert_eq!(result.findings[0].title, "Double free");
        assert_eq!(result.findings[0].id, "COR-012");
    }

    #[test]
    fn test_late_producers_get_distinct_prefixes() {
        let mut extractor = FindingExtractor::new();
        let h = DedupHierarchy::default();
        let mut ids = Vec::new();
        for name in ["test", "reviewer1", "reviewer2", "test"] {
            let output = WorkerOutput::new(1, 0, Producer::from_name(name), "## [P3] X\nLocation: a.rs:1\n");
            ids.extend(extractor.extract(&output, &h).findings.into_iter().map(|f| f.id));
        }
        assert_eq!(ids, vec!["TEST2-001", "REVIEW-001", "REVIEW2-001", "TEST2-002"]);
    }

    #[test]
    fn test_custom_producer_prefix() {
        let result = extract("i18n", "## [P2] Untranslated string\nLocation: ui/app.ts:4\n");
        assert_eq!(result.findings[0].id, "I18N-001");
    }

    #[test]
    fn test_untagged_headings_are_prose() {
        let text = "## Summary\nLocation: a.rs:1\n## [P2] Real\nLocation: a.rs:5\n";
        let result = extract("correctness", text);
        assert_eq!(result.findings.len(), 1);
        assert!(result.failures.is_empty());
    }
}
