//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// ReviewConverge - aggregation core for parallel code reviewers
///
/// Reads the worker outputs of each review round from disk, scores every
/// chunk against the quality gate, and decides whether to converge, retry
/// the failing chunks, or halt. Writes a JSON convergence report.
///
/// Examples:
///   review-converge --changeset changeset.json --rounds ./rounds
///   review-converge --changeset changeset.json --rounds ./rounds --tier thorough
///   review-converge --changeset changeset.json --rounds ./rounds --fail-on-halt
///   review-converge --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Changeset description (JSON): files with signals and the chunk partition
    #[arg(long, value_name = "FILE", required_unless_present = "init_config")]
    pub changeset: Option<PathBuf>,

    /// Directory holding round-<N>/chunk-<I>/<producer>.md worker outputs
    #[arg(long, value_name = "DIR", required_unless_present = "init_config")]
    pub rounds: Option<PathBuf>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .reviewconverge.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Force a convergence tier (minimal, standard, thorough)
    ///
    /// Unknown values are ignored with a warning and the tier is chosen
    /// from the changeset.
    #[arg(long, value_name = "TIER", env = "REVIEW_CONVERGE_TIER")]
    pub tier: Option<String>,

    /// Output file path for the JSON report
    ///
    /// Default: from config or review_converge.json
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Maximum context files injected per flagged chunk (clamped to 1-5)
    #[arg(long, value_name = "COUNT")]
    pub max_context_files: Option<usize>,

    /// Exit with code 2 when the run halts without converging
    ///
    /// Useful for CI pipelines.
    #[arg(long)]
    pub fail_on_halt: bool,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Generate a default .reviewconverge.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        match self.changeset {
            Some(ref path) if !path.is_file() => {
                return Err(format!("Changeset file does not exist: {}", path.display()));
            }
            None => return Err("--changeset is required".to_string()),
            _ => {}
        }

        match self.rounds {
            Some(ref path) if !path.is_dir() => {
                return Err(format!("Rounds directory does not exist: {}", path.display()));
            }
            None => return Err("--rounds is required".to_string()),
            _ => {}
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
