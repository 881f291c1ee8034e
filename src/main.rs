//! ReviewConverge - aggregation core for parallel code reviewers
//!
//! A CLI tool that reads per-round worker review output from disk, drives
//! the convergence loop, and writes a JSON convergence report.
//!
//! Exit codes:
//!   0 - Success (converged, or a retry round is pending)
//!   1 - Runtime error (bad changeset, config, systemic failure, etc.)
//!   2 - Run halted without converging and --fail-on-halt is set

use anyhow::{Context, Result};
use review_converge::analysis::convergence::Verdict;
use review_converge::cli::Args;
use review_converge::config::{Config, CONFIG_FILE_NAME};
use review_converge::models::Changeset;
use review_converge::report;
use review_converge::scanner::RoundScanner;
use review_converge::ReviewRun;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("ReviewConverge v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args) {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .reviewconverge.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to customize thresholds, tier, producers, and more.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Process every round found on disk. Returns exit code (0 or 2).
fn run(args: Args) -> Result<i32> {
    // Load configuration
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    let output = PathBuf::from(&config.general.output);

    let changeset_path = args
        .changeset
        .as_deref()
        .context("--changeset is required")?;
    let rounds_dir = args.rounds.clone().context("--rounds is required")?;

    let changeset = load_changeset(changeset_path)?;
    let mut review = ReviewRun::new(&changeset, config)?;
    let scanner = RoundScanner::new(rounds_dir);

    while !review.is_finished() {
        let round = review.next_round();
        if !scanner.round_exists(round) {
            if round == 0 {
                warn!("No round-0 directory under the rounds directory; nothing to evaluate");
            } else {
                info!("Round {} not run yet; stopping with retry pending", round);
            }
            break;
        }

        let outputs = scanner.load_round(round)?;
        if !args.quiet {
            println!("🔬 Round {}: {} worker output(s)", round, outputs.len());
        }

        let outcome = review
            .ingest_round(outputs)
            .with_context(|| format!("Round {} could not be evaluated", round))?;

        if !args.quiet {
            match outcome.round.halt_reason {
                Some(reason) => println!(
                    "   {} failing chunk(s) -> {} ({})",
                    outcome.round.failing_count(),
                    outcome.round.verdict,
                    reason
                ),
                None => println!(
                    "   {} failing chunk(s) -> {}",
                    outcome.round.failing_count(),
                    outcome.round.verdict
                ),
            }
        }
    }

    let result = review.finish();
    report::write_json_report(&result, &output)
        .with_context(|| format!("Failed to write report to {}", output.display()))?;

    if !args.quiet {
        println!("\n📊 Convergence Summary:");
        for line in report::generate_summary_text(&result).lines() {
            println!("   {}", line);
        }
        println!("\n✅ Report saved to: {}", output.display());
    }

    if args.fail_on_halt && result.report.final_verdict == Some(Verdict::Halted) {
        eprintln!("\n⛔ Review halted without converging. Failing (exit code 2).");
        return Ok(2);
    }

    Ok(0)
}

/// Read and parse the changeset description.
fn load_changeset(path: &Path) -> Result<Changeset> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read changeset: {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse changeset: {}", path.display()))
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE_NAME);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {:#}", e);
            Ok(Config::default())
        }
    }
}
