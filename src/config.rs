//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.reviewconverge.toml` files. Values are never trusted as-is: thresholds,
//! tier overrides and hierarchy entries are validated by the stages that
//! consume them, which fall back to built-in defaults with a notice.

use crate::analysis::scorer::Thresholds;
use crate::models::{Notice, NoticeKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Default config file name, looked up in the current directory.
pub const CONFIG_FILE_NAME: &str = ".reviewconverge.toml";

/// Hard ceiling on injected cross-chunk context files.
pub const MAX_CONTEXT_FILES: usize = 5;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Quality gate thresholds.
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Convergence loop settings.
    #[serde(default)]
    pub convergence: ConvergenceConfig,

    /// Dedup hierarchy settings.
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Cross-chunk context settings.
    #[serde(default)]
    pub context: ContextConfig,

    /// Changeset classification settings.
    #[serde(default)]
    pub changeset: ChangesetConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path for the JSON result.
    #[serde(default = "default_output")]
    pub output: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
        }
    }
}

fn default_output() -> String {
    "review_converge.json".to_string()
}

/// Threshold overrides per chunk profile.
///
/// Kept as raw TOML values so that a non-numeric entry is reported and
/// defaulted instead of failing the whole file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub code: BTreeMap<String, toml::Value>,

    #[serde(default)]
    pub doc: BTreeMap<String, toml::Value>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            code: Thresholds::code_defaults().to_toml_table(),
            doc: Thresholds::doc_defaults().to_toml_table(),
        }
    }
}

/// Convergence loop settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Explicit tier override: minimal, standard or thorough. Kept raw so
    /// a mistyped value is ignored with a notice by the tier selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<toml::Value>,
}

impl ConvergenceConfig {
    /// The override as text, whatever TOML type it was written as.
    pub fn tier_override(&self) -> Option<String> {
        self.tier.as_ref().map(|value| match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Dedup hierarchy settings.
///
/// Built-in producers keep their fixed relative order; extension producers
/// are slotted in by position or appended at the lowest priority.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Extension producers.
    #[serde(default)]
    pub custom: Vec<CustomProducerConfig>,
}

/// A user-defined producer category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomProducerConfig {
    pub name: String,

    /// Finding-id prefix. Derived from the name when absent or invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<toml::Value>,

    /// 0-based position in the hierarchy. Appended at lowest priority when
    /// absent or not an integer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<toml::Value>,
}

/// Cross-chunk context settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Maximum number of context files per flagged chunk (1..=5).
    #[serde(default = "default_max_context_files")]
    pub max_files: toml::Value,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_context_files(),
        }
    }
}

fn default_max_context_files() -> toml::Value {
    toml::Value::Integer(MAX_CONTEXT_FILES as i64)
}

impl ContextConfig {
    /// The configured cap, clamped to `1..=MAX_CONTEXT_FILES`. A value that
    /// had to be clamped or replaced comes back with a notice.
    pub fn effective_max_files(&self) -> (usize, Option<Notice>) {
        let (max_files, message) = match self.max_files.as_integer() {
            Some(requested) => {
                let clamped = requested.clamp(1, MAX_CONTEXT_FILES as i64);
                if clamped == requested {
                    return (clamped as usize, None);
                }
                (
                    clamped as usize,
                    format!("context.max_files = {} clamped to {}", requested, clamped),
                )
            }
            None => (
                MAX_CONTEXT_FILES,
                format!(
                    "context.max_files = {} is not an integer; using {}",
                    self.max_files, MAX_CONTEXT_FILES
                ),
            ),
        };

        warn!("{}", message);
        (max_files, Some(Notice::new(NoticeKind::ConfigValueAdjusted, message)))
    }
}

/// Changeset classification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesetConfig {
    /// Extensions classified as source code when deriving chunk type.
    #[serde(default = "default_source_extensions")]
    pub source_extensions: Vec<String>,
}

impl Default for ChangesetConfig {
    fn default() -> Self {
        Self {
            source_extensions: default_source_extensions(),
        }
    }
}

fn default_source_extensions() -> Vec<String> {
    vec![
        "rs", "py", "js", "ts", "jsx", "tsx", "go", "java", "c", "cpp", "h", "hpp", "cs", "rb",
        "php", "swift", "kt", "scala", "vue", "svelte", "sql", "sh",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE_NAME);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when explicitly provided.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref tier) = args.tier {
            self.convergence.tier = Some(toml::Value::String(tier.clone()));
        }

        if let Some(max) = args.max_context_files {
            self.context.max_files =
                toml::Value::Integer(i64::try_from(max).unwrap_or(i64::MAX));
        }

        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.output, "review_converge.json");
        assert_eq!(config.context.effective_max_files(), (5, None));
        assert!(config.convergence.tier_override().is_none());
        assert!(config.changeset.source_extensions.contains(&"rs".to_string()));
        assert!(config.scoring.code.contains_key("coverage_completeness"));
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[scoring.code]
coverage_completeness = 0.5
evidence_ratio = "lots"

[convergence]
tier = "thorough"

[[dedup.custom]]
name = "i18n"
prefix = "I18N"
position = 1

[context]
max_files = 12
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(
            config.scoring.code.get("coverage_completeness"),
            Some(&toml::Value::Float(0.5))
        );
        assert!(config.scoring.code.get("evidence_ratio").unwrap().is_str());
        assert!(config.scoring.doc.is_empty());
        assert_eq!(config.convergence.tier_override().as_deref(), Some("thorough"));
        assert_eq!(config.dedup.custom[0].name, "i18n");
        assert_eq!(config.dedup.custom[0].position, Some(toml::Value::Integer(1)));

        let (max_files, notice) = config.context.effective_max_files();
        assert_eq!(max_files, 5);
        assert_eq!(notice.map(|n| n.kind), Some(NoticeKind::ConfigValueAdjusted));
    }

    #[test]
    fn test_mistyped_values_keep_the_rest_of_the_file() {
        let toml_content = r#"
[convergence]
tier = 3

[scoring.code]
coverage_completeness = 0.9

[[dedup.custom]]
name = "i18n"
prefix = 7
position = -2

[context]
max_files = "many"
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(
            config.scoring.code.get("coverage_completeness"),
            Some(&toml::Value::Float(0.9))
        );
        assert_eq!(config.convergence.tier_override().as_deref(), Some("3"));
        assert_eq!(config.dedup.custom[0].position, Some(toml::Value::Integer(-2)));

        let (max_files, notice) = config.context.effective_max_files();
        assert_eq!(max_files, MAX_CONTEXT_FILES);
        assert!(notice.is_some());
    }

    #[test]
    fn test_effective_max_files_clamped() {
        let config = ContextConfig {
            max_files: toml::Value::Integer(0),
        };
        assert_eq!(config.effective_max_files().0, 1);

        let config = ContextConfig {
            max_files: toml::Value::Integer(-1),
        };
        let (max_files, notice) = config.effective_max_files();
        assert_eq!(max_files, 1);
        assert!(notice.unwrap().message.contains("-1"));

        let config = ContextConfig {
            max_files: toml::Value::Integer(3),
        };
        assert_eq!(config.effective_max_files(), (3, None));
    }

    #[test]
    fn test_merge_with_args() {
        let args = crate::cli::Args {
            changeset: None,
            rounds: None,
            config: None,
            tier: Some("exhaustive".to_string()),
            output: Some("out/report.json".into()),
            max_context_files: Some(9),
            fail_on_halt: false,
            verbose: false,
            quiet: false,
            init_config: false,
        };

        let mut config = Config::default();
        config.merge_with_args(&args);
        assert_eq!(config.convergence.tier_override().as_deref(), Some("exhaustive"));
        assert_eq!(config.general.output, "out/report.json");

        let (max_files, notice) = config.context.effective_max_files();
        assert_eq!(max_files, MAX_CONTEXT_FILES);
        assert!(notice.unwrap().message.contains("9"));
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[scoring.code]"));
        assert!(toml_str.contains("[context]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.context.effective_max_files(), (5, None));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[convergence]\ntier = \"minimal\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.convergence.tier_override().as_deref(), Some("minimal"));

        std::fs::write(&path, "[convergence\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
