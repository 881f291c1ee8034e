//! Cross-chunk context selection for retry rounds.
//!
//! A chunk flagged for retry is re-reviewed with a few read-only files from
//! other chunks: the files its own files reference, and the files that its
//! reviewers already reported findings against. References come from the
//! content under review, so every candidate path is validated before use.

use crate::config::MAX_CONTEXT_FILES;
use crate::models::{Chunk, Finding, Notice, NoticeKind, ResolvedChangeset};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Component, Path};
use std::sync::LazyLock;
use tracing::{debug, warn};

static SAFE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_@+\-.][A-Za-z0-9_./@+\-]*$").expect("valid regex literal"));

/// Select up to `max_files` context paths for `chunk`.
///
/// Import references are taken first, in the chunk's file order, followed
/// by the targets of findings reported by this chunk's reviewers. Paths
/// that fail validation are skipped with a notice; paths that do not
/// resolve to another chunk are skipped silently.
pub fn select_context(
    chunk: &Chunk,
    changeset: &ResolvedChangeset,
    findings: &[Finding],
    max_files: usize,
) -> (Vec<String>, Vec<Notice>) {
    let cap = max_files.clamp(1, MAX_CONTEXT_FILES);
    let mut notices = Vec::new();
    let mut selected: Vec<String> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();

    let references = chunk.files.iter().flat_map(|file| {
        changeset
            .files
            .get(file)
            .map(|f| f.references.as_slice())
            .unwrap_or_default()
            .iter()
            .map(move |reference| (file.as_str(), reference.as_str()))
    });

    for (from, reference) in references {
        let Some(path) = resolve_reference(from, reference) else {
            reject(chunk, reference, &format!("referenced from {}", from), &mut notices);
            continue;
        };
        consider(chunk, changeset, path, &mut selected, &mut seen);
    }

    let reported = findings
        .iter()
        .filter(|f| f.origin_chunk == Some(chunk.index))
        .map(|f| f.location.file.as_str());

    for file in reported {
        let Some(path) = normalize(file) else {
            reject(chunk, file, "reported in a finding", &mut notices);
            continue;
        };
        consider(chunk, changeset, path, &mut selected, &mut seen);
    }

    if selected.len() > cap {
        debug!(
            "Chunk {}: {} context candidates, keeping {}",
            chunk.index,
            selected.len(),
            cap
        );
        selected.truncate(cap);
    }

    (selected, notices)
}

fn consider(
    chunk: &Chunk,
    changeset: &ResolvedChangeset,
    path: String,
    selected: &mut Vec<String>,
    seen: &mut BTreeSet<String>,
) {
    match changeset.chunk_of(&path) {
        Some(owner) if owner != chunk.index => {
            if seen.insert(path.clone()) {
                selected.push(path);
            }
        }
        Some(_) => {}
        None => debug!("Chunk {}: {} is not part of the changeset", chunk.index, path),
    }
}

fn reject(chunk: &Chunk, raw: &str, origin: &str, notices: &mut Vec<Notice>) {
    warn!("Chunk {}: rejecting unsafe context path '{}' ({})", chunk.index, raw, origin);
    notices.push(Notice::new(
        NoticeKind::ContextReferenceRejected,
        format!("chunk {}: unsafe context path '{}' ({})", chunk.index, raw, origin),
    ));
}

/// Resolve an import reference written in `from`.
///
/// `./x` resolves against the importing file's directory; anything else is
/// taken as repo-relative.
fn resolve_reference(from: &str, reference: &str) -> Option<String> {
    let reference = reference.trim();
    let joined = match reference.strip_prefix("./") {
        Some(rest) => match Path::new(from).parent().and_then(Path::to_str) {
            Some(dir) if !dir.is_empty() => format!("{}/{}", dir, rest),
            _ => rest.to_string(),
        },
        None => reference.to_string(),
    };
    normalize(&joined)
}

/// Validate a repo-relative path. Absolute paths, backslashes, traversal
/// segments and characters outside the safe set are rejected.
fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches('`');
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    if trimmed.is_empty() || !SAFE_PATH.is_match(trimmed) {
        return None;
    }
    if !is_safe_relative_path(Path::new(trimmed)) {
        return None;
    }
    let segments: Vec<&str> = trimmed
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

fn is_safe_relative_path(path: &Path) -> bool {
    if path.is_absolute() {
        return false;
    }
    path.components()
        .all(|component| matches!(component, Component::CurDir | Component::Normal(_)))
}
