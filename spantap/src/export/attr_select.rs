//! User-supplied attribute selection: metric-name globs mapped to
//! include/exclude lists, consulted by the exporters when deciding which
//! attributes a metric carries.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct InclusionLists {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Metric-name glob → inclusion lists.
///
/// `matching` and `normalize` may be called from different tasks at the
/// same time; the table holds a single read/write guard, with the write
/// side covering a whole normalization pass.
#[derive(Default)]
pub struct Selection {
    entries: RwLock<HashMap<String, InclusionLists>>,
}

impl Selection {
    pub fn new(entries: HashMap<String, InclusionLists>) -> Self {
        Selection {
            entries: RwLock::new(entries),
        }
    }

    /// Inclusion lists of every glob matching `metric_name`, ordered from
    /// least to most specific so later entries override earlier ones.
    /// Specificity is the number of literal characters in the glob; ties
    /// break lexicographically. The ordering is deterministic.
    pub fn matching(&self, metric_name: &str) -> Vec<InclusionLists> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<(&String, &InclusionLists)> = entries
            .iter()
            .filter(|(pattern, _)| {
                glob::Pattern::new(pattern)
                    .map(|p| p.matches(metric_name))
                    .unwrap_or(false)
            })
            .collect();
        matched.sort_by(|(a, _), (b, _)| {
            specificity(a)
                .cmp(&specificity(b))
                .then_with(|| a.cmp(b))
        });
        matched.into_iter().map(|(_, lists)| lists.clone()).collect()
    }

    /// Rewrite every key into canonical dotted-lowercase form. Idempotent:
    /// normalizing twice equals normalizing once.
    pub fn normalize(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let normalized: HashMap<String, InclusionLists> = entries
            .drain()
            .map(|(k, v)| (normalize_name(&k), v))
            .collect();
        *entries = normalized;
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

/// Decide whether one attribute survives the matched inclusion lists.
/// Lists arrive least-specific first; later lists override earlier ones.
/// With no include globs anywhere, every attribute is kept unless excluded.
pub fn attribute_allowed(lists: &[InclusionLists], attr_name: &str) -> bool {
    let mut allowed = !lists.iter().any(|l| !l.include.is_empty());
    for l in lists {
        if l.include.iter().any(|g| glob_matches(g, attr_name)) {
            allowed = true;
        }
        if l.exclude.iter().any(|g| glob_matches(g, attr_name)) {
            allowed = false;
        }
    }
    allowed
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(value))
        .unwrap_or(false)
}

/// Literal characters only: wildcards and character-class syntax don't make
/// a glob more specific.
fn specificity(pattern: &str) -> usize {
    pattern
        .chars()
        .filter(|c| !matches!(c, '*' | '?' | '[' | ']'))
        .count()
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .replace(['_', '/'], ".")
}
