//! Worker output scanner.
//!
//! Worker outputs are laid out on disk as
//! `<rounds_dir>/round-<N>/chunk-<I>/<producer>.{md,txt,jsonl}`.
//! A missing round directory means the round has not run yet. Files that
//! cannot be read or do not follow the layout are skipped with a warning.

use crate::analysis::extractor::WorkerOutput;
use crate::models::Producer;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Extensions recognized as worker output documents.
pub const OUTPUT_EXTENSIONS: [&str; 3] = ["md", "txt", "jsonl"];

/// Worker documents larger than this are skipped.
pub const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

/// Loads worker outputs for one round at a time.
#[derive(Debug, Clone)]
pub struct RoundScanner {
    rounds_dir: PathBuf,
}

impl RoundScanner {
    pub fn new(rounds_dir: PathBuf) -> Self {
        Self { rounds_dir }
    }

    pub fn round_dir(&self, round: usize) -> PathBuf {
        self.rounds_dir.join(format!("round-{}", round))
    }

    /// Whether the round has been executed (its directory exists).
    pub fn round_exists(&self, round: usize) -> bool {
        self.round_dir(round).is_dir()
    }

    /// Load every worker output of a round, ordered by chunk then file name.
    pub fn load_round(&self, round: usize) -> Result<Vec<WorkerOutput>> {
        let dir = self.round_dir(round);
        if !dir.is_dir() {
            return Err(anyhow::anyhow!("Round directory not found: {}", dir.display()));
        }

        let mut outputs = Vec::new();
        let walker = WalkDir::new(&dir)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e.file_name().to_str().unwrap_or("")));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Cannot read entry under {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let Some(chunk) = path.parent().and_then(parse_chunk_dir) else {
                debug!("Skipping {}: not inside a chunk-<N> directory", path.display());
                continue;
            };
            let Some(producer) = producer_of(path) else {
                debug!("Skipping {}: not a worker output document", path.display());
                continue;
            };

            match read_output(path) {
                Ok(text) => outputs.push(WorkerOutput::new(round, chunk, producer, text)),
                Err(e) => warn!("Skipping {}: {:#}", path.display(), e),
            }
        }

        outputs.sort_by_key(|o| o.chunk);
        debug!("Round {}: loaded {} worker output(s)", round, outputs.len());
        Ok(outputs)
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// `chunk-3` -> 3
fn parse_chunk_dir(dir: &Path) -> Option<usize> {
    dir.file_name()?
        .to_str()?
        .strip_prefix("chunk-")?
        .parse()
        .ok()
}

fn producer_of(path: &Path) -> Option<Producer> {
    let ext = path.extension()?.to_str()?;
    if !OUTPUT_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?.trim();
    if stem.is_empty() {
        return None;
    }
    Some(Producer::from_name(stem))
}

fn read_output(path: &Path) -> Result<String> {
    let metadata = fs::metadata(path).context("Failed to stat worker output")?;
    if metadata.len() > MAX_OUTPUT_BYTES {
        return Err(anyhow::anyhow!(
            "{} bytes exceeds the {} byte limit",
            metadata.len(),
            MAX_OUTPUT_BYTES
        ));
    }
    fs::read_to_string(path).context("Failed to read worker output")
}
