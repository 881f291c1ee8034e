//! Finding deduplication.
//!
//! Findings are bucketed by file and 5-line window. Within a bucket the
//! most severe assertion wins, then the more recent round, then the
//! higher-ranked producer; losers are recorded in `also_flagged_by`.
//! Questions and nits never displace an assertion, and never displace each
//! other across interaction types. Challenge findings bypass all of it.
//!
//! Input is sorted before processing so the output, including the order of
//! `also_flagged_by`, does not depend on input order.

use crate::analysis::hierarchy::DedupHierarchy;
use crate::models::{Finding, Interaction};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Lines per location bucket.
pub const WINDOW_LINES: usize = 5;

type Bucket = (String, usize);

fn bucket(finding: &Finding) -> Bucket {
    (
        finding.location.file.clone(),
        finding.location.line / WINDOW_LINES,
    )
}

/// Processing order: severity, then later round, then producer rank.
/// The remaining keys only make the order total.
fn precedence(a: &Finding, b: &Finding, hierarchy: &DedupHierarchy) -> Ordering {
    b.severity
        .cmp(&a.severity)
        .then_with(|| b.round.cmp(&a.round))
        .then_with(|| {
            hierarchy
                .rank_or_lowest(&a.producer)
                .cmp(&hierarchy.rank_or_lowest(&b.producer))
        })
        .then_with(|| a.producer.cmp(&b.producer))
        .then_with(|| b.has_evidence().cmp(&a.has_evidence()))
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.location.cmp(&b.location))
        .then_with(|| a.interaction.cmp(&b.interaction))
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.title.cmp(&b.title))
}

/// Display order of the final set: severity, producer rank, location.
fn display_order(a: &Finding, b: &Finding, hierarchy: &DedupHierarchy) -> Ordering {
    b.severity
        .cmp(&a.severity)
        .then_with(|| {
            hierarchy
                .rank_or_lowest(&a.producer)
                .cmp(&hierarchy.rank_or_lowest(&b.producer))
        })
        .then_with(|| a.producer.cmp(&b.producer))
        .then_with(|| a.location.cmp(&b.location))
        .then_with(|| a.interaction.cmp(&b.interaction))
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| b.round.cmp(&a.round))
}

/// Sort findings into the final display order.
pub fn sort_for_display(findings: &mut [Finding], hierarchy: &DedupHierarchy) {
    findings.sort_by(|a, b| display_order(a, b, hierarchy));
}

/// Deduplicate a set of findings into the final ordered set.
pub fn dedup(findings: Vec<Finding>, hierarchy: &DedupHierarchy) -> Vec<Finding> {
    let input_len = findings.len();

    let unknown: BTreeSet<&str> = findings
        .iter()
        .filter(|f| !hierarchy.contains(&f.producer))
        .map(|f| f.producer.name())
        .collect();
    for producer in unknown {
        warn!("Producer '{}' has no dedup rank; treating as lowest priority", producer);
    }

    let mut sorted = findings;
    sorted.sort_by(|a, b| precedence(a, b, hierarchy));

    let (exempt, rest): (Vec<Finding>, Vec<Finding>) =
        sorted.into_iter().partition(|f| f.producer.is_exempt());
    let (assertions, interactions): (Vec<Finding>, Vec<Finding>) =
        rest.into_iter().partition(Finding::is_assertion);

    // Pass 1: one assertion per location bucket.
    let mut kept: Vec<Finding> = Vec::with_capacity(assertions.len());
    let mut by_bucket: HashMap<Bucket, usize> = HashMap::new();
    for finding in assertions {
        match by_bucket.get(&bucket(&finding)) {
            Some(&idx) => {
                debug!("{} merged into {}", finding.id, kept[idx].id);
                kept[idx].absorb(&finding);
            }
            None => {
                by_bucket.insert(bucket(&finding), kept.len());
                kept.push(finding);
            }
        }
    }

    // Pass 2: questions and nits yield to assertions, merge per type.
    let mut interaction_kept: Vec<Finding> = Vec::new();
    let mut by_typed_bucket: HashMap<(Bucket, Interaction), usize> = HashMap::new();
    for finding in interactions {
        let key = bucket(&finding);
        if let Some(&idx) = by_bucket.get(&key) {
            debug!("{} superseded by assertion {}", finding.id, kept[idx].id);
            kept[idx].absorb(&finding);
            continue;
        }
        let typed = (key, finding.interaction);
        match by_typed_bucket.get(&typed) {
            Some(&idx) => interaction_kept[idx].absorb(&finding),
            None => {
                by_typed_bucket.insert(typed, interaction_kept.len());
                interaction_kept.push(finding);
            }
        }
    }

    let mut result: Vec<Finding> = exempt;
    result.extend(kept);
    result.extend(interaction_kept);
    sort_for_display(&mut result, hierarchy);

    debug!("Dedup: {} findings in, {} out", input_len, result.len());
    result
}

/// Merge a retry round's findings into the running result.
///
/// At equal severity the later round's finding supersedes the earlier one.
/// Challenge findings from every round are kept.
pub fn merge_rounds(
    running: Vec<Finding>,
    incoming: Vec<Finding>,
    hierarchy: &DedupHierarchy,
) -> Vec<Finding> {
    let mut all = running;
    all.extend(incoming);
    dedup(all, hierarchy)
}
