//! Producer priority hierarchy used to resolve dedup ties.
//!
//! Built once per run and read-only afterwards. Ranks are plain indices:
//! rank 0 is the highest priority.

use crate::config::{CustomProducerConfig, DedupConfig};
use crate::models::{BuiltinProducer, Notice, NoticeKind, Producer};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use tracing::warn;

static CUSTOM_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,31}$").expect("valid regex literal"));

static PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9]{1,7}$").expect("valid regex literal"));

#[derive(Debug, Clone, PartialEq)]
pub struct DedupHierarchy {
    order: Vec<Producer>,
    ranks: HashMap<Producer, usize>,
    prefixes: HashMap<Producer, String>,
}

impl Default for DedupHierarchy {
    fn default() -> Self {
        let order = BuiltinProducer::ALL.into_iter().map(Producer::Builtin).collect();
        Self::from_order(order, HashMap::new())
    }
}

impl DedupHierarchy {
    fn from_order(order: Vec<Producer>, custom_prefixes: HashMap<Producer, String>) -> Self {
        let ranks = order
            .iter()
            .enumerate()
            .map(|(rank, p)| (p.clone(), rank))
            .collect();
        let prefixes = order
            .iter()
            .map(|p| {
                let prefix = match p {
                    Producer::Builtin(b) => b.prefix().to_string(),
                    Producer::Custom(_) => custom_prefixes
                        .get(p)
                        .cloned()
                        .unwrap_or_else(|| derive_prefix(p.name())),
                };
                (p.clone(), prefix)
            })
            .collect();
        Self {
            order,
            ranks,
            prefixes,
        }
    }

    /// Build the hierarchy from config plus every producer active in the run.
    ///
    /// Custom producers are inserted at their configured position (clamped)
    /// or appended. Active producers that appear nowhere are appended at
    /// the lowest priority with a notice.
    pub fn build<'a>(
        config: &DedupConfig,
        active: impl IntoIterator<Item = &'a Producer>,
    ) -> (Self, Vec<Notice>) {
        let mut notices = Vec::new();
        let mut order: Vec<Producer> = BuiltinProducer::ALL
            .into_iter()
            .map(Producer::Builtin)
            .collect();
        let mut custom_prefixes: HashMap<Producer, String> = HashMap::new();
        let mut used_prefixes: HashSet<String> = BuiltinProducer::ALL
            .iter()
            .map(|b| b.prefix().to_string())
            .collect();

        let mut positioned: Vec<(usize, Producer)> = Vec::new();
        let mut appended: Vec<Producer> = Vec::new();

        for entry in &config.custom {
            let Some(producer) =
                validate_custom(entry, &order, &positioned, &appended, &mut notices)
            else {
                continue;
            };

            let prefix = assign_prefix(entry, &producer, &used_prefixes, &mut notices);
            used_prefixes.insert(prefix.clone());
            custom_prefixes.insert(producer.clone(), prefix);

            match resolve_position(entry, &producer, &mut notices) {
                Some(position) => positioned.push((position, producer)),
                None => appended.push(producer),
            }
        }

        positioned.sort_by_key(|(position, _)| *position);
        for (position, producer) in positioned {
            let at = position.min(order.len());
            order.insert(at, producer);
        }
        order.extend(appended);

        for producer in active {
            if !order.contains(producer) {
                warn!(
                    "Producer '{}' is not in the dedup hierarchy; appending at lowest priority",
                    producer
                );
                let prefix = unique_prefix(&derive_prefix(producer.name()), &used_prefixes);
                used_prefixes.insert(prefix.clone());
                custom_prefixes.insert(producer.clone(), prefix);
                notices.push(Notice::new(
                    NoticeKind::ProducerAutoAppended,
                    format!("producer '{}' auto-appended at lowest priority", producer),
                ));
                order.push(producer.clone());
            }
        }

        (Self::from_order(order, custom_prefixes), notices)
    }

    /// Rank of a producer, or `None` when it is not part of the hierarchy.
    pub fn rank(&self, producer: &Producer) -> Option<usize> {
        self.ranks.get(producer).copied()
    }

    /// Rank used for ordering: unknown producers sort after every known one.
    pub fn rank_or_lowest(&self, producer: &Producer) -> usize {
        self.rank(producer).unwrap_or(self.order.len())
    }

    pub fn contains(&self, producer: &Producer) -> bool {
        self.ranks.contains_key(producer)
    }

    pub fn order(&self) -> &[Producer] {
        &self.order
    }

    /// Finding-id prefix owned by a producer.
    ///
    /// A producer outside the hierarchy gets a derived prefix that no
    /// member already owns.
    pub fn prefix_for(&self, producer: &Producer) -> String {
        match producer {
            Producer::Builtin(b) => b.prefix().to_string(),
            Producer::Custom(name) => self
                .prefixes
                .get(producer)
                .cloned()
                .unwrap_or_else(|| unique_prefix(&derive_prefix(name), &self.owned_prefixes())),
        }
    }

    /// Every prefix owned by a member of the hierarchy.
    pub fn owned_prefixes(&self) -> HashSet<String> {
        self.prefixes.values().cloned().collect()
    }
}

fn validate_custom(
    entry: &CustomProducerConfig,
    order: &[Producer],
    positioned: &[(usize, Producer)],
    appended: &[Producer],
    notices: &mut Vec<Notice>,
) -> Option<Producer> {
    let name = entry.name.trim().to_lowercase();
    let producer = Producer::from_name(&name);

    let problem = if !CUSTOM_NAME.is_match(&name) {
        Some("is not a valid producer name")
    } else if matches!(producer, Producer::Builtin(_)) || order.contains(&producer) {
        Some("collides with a built-in producer")
    } else if positioned.iter().any(|(_, p)| *p == producer) || appended.contains(&producer) {
        Some("is listed more than once")
    } else {
        None
    };

    match problem {
        Some(problem) => {
            warn!("Ignoring custom producer '{}': {}", entry.name, problem);
            notices.push(Notice::new(
                NoticeKind::HierarchyEntryIgnored,
                format!("custom producer '{}' {}", entry.name, problem),
            ));
            None
        }
        None => Some(producer),
    }
}

fn assign_prefix(
    entry: &CustomProducerConfig,
    producer: &Producer,
    used: &HashSet<String>,
    notices: &mut Vec<Notice>,
) -> String {
    if let Some(ref raw) = entry.prefix {
        let prefix = match raw {
            toml::Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        };
        if PREFIX.is_match(&prefix) && !used.contains(&prefix) {
            return prefix;
        }
        warn!(
            "Rejecting prefix '{}' for producer '{}' (malformed or reserved)",
            raw, producer
        );
        notices.push(Notice::new(
            NoticeKind::CustomPrefixRejected,
            format!(
                "prefix '{}' for '{}' is malformed or already reserved; deriving one",
                raw, producer
            ),
        ));
    }

    unique_prefix(&derive_prefix(producer.name()), used)
}

/// Configured position of a custom producer. Negative positions clamp to
/// the top; anything that is not an integer appends the producer.
fn resolve_position(
    entry: &CustomProducerConfig,
    producer: &Producer,
    notices: &mut Vec<Notice>,
) -> Option<usize> {
    let raw = entry.position.as_ref()?;
    let message = match raw.as_integer() {
        Some(position) if position >= 0 => {
            return Some(usize::try_from(position).unwrap_or(usize::MAX));
        }
        Some(position) => format!("position {} for '{}' clamped to 0", position, producer),
        None => format!(
            "position {} for '{}' is not an integer; appending at lowest priority",
            raw, producer
        ),
    };

    warn!("{}", message);
    notices.push(Notice::new(NoticeKind::ConfigValueAdjusted, message));
    raw.as_integer().map(|_| 0)
}

/// `base`, or `base` with the first free numeric suffix when `base` is taken.
pub(crate) fn unique_prefix(base: &str, used: &HashSet<String>) -> String {
    if !used.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}{}", &base[..base.len().min(6)], n))
        .find(|candidate| !used.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Uppercase alphanumeric prefix derived from a producer name.
pub(crate) fn derive_prefix(name: &str) -> String {
    let mut prefix: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .skip_while(|c| c.is_ascii_digit())
        .take(6)
        .collect();
    if prefix.len() < 2 {
        prefix = format!("X{}", prefix);
        while prefix.len() < 2 {
            prefix.push('X');
        }
    }
    prefix
}
