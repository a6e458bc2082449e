//! Invalidation planning
//!
//! Turns a changed-path set into the smallest pattern set the CDN bills
//! for, bounded by the provider's per-request path ceiling.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::invalidation::cost::CostModel;
use crate::storage::settings::CdnSettings;

/// Pattern that invalidates the whole distribution
pub const FULL_PATTERN: &str = "/*";

/// Result of planning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationPlan {
    /// Sorted, deduplicated patterns
    pub patterns: Vec<String>,

    /// Cost of `patterns`, in micro-USD
    pub estimated_cost_micros: u64,

    /// Distinct changed paths before collapsing
    pub raw_path_count: usize,
}

impl InvalidationPlan {
    /// An empty plan is a no-op for the caller
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.patterns.len() == 1 && self.patterns[0] == FULL_PATTERN
    }
}

/// Collapses changed paths into invalidation patterns
#[derive(Debug, Clone)]
pub struct InvalidationPlanner {
    path_ceiling: usize,
    collapse_threshold: usize,
    cost: CostModel,
}

impl InvalidationPlanner {
    pub fn new(path_ceiling: usize, collapse_threshold: usize, cost: CostModel) -> Self {
        Self {
            path_ceiling: path_ceiling.max(1),
            collapse_threshold: collapse_threshold.max(2),
            cost,
        }
    }

    pub fn from_settings(settings: &CdnSettings) -> Self {
        Self::new(settings.path_ceiling, settings.collapse_threshold, settings.cost)
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost
    }

    /// Plan an invalidation for `changed_paths`
    pub fn plan<S: AsRef<str>>(&self, changed_paths: &[S]) -> InvalidationPlan {
        let paths: BTreeSet<String> = changed_paths
            .iter()
            .filter_map(|p| normalize(p.as_ref()))
            .collect();
        let raw_path_count = paths.len();

        if paths.contains(FULL_PATTERN) {
            return self.full_with_raw(raw_path_count);
        }

        // Group files by parent directory. Directory routes such as `/` or
        // `/blog/` and caller-supplied wildcards are kept verbatim and do
        // not count toward any group.
        let mut verbatim: BTreeSet<String> = BTreeSet::new();
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for path in paths {
            if path.ends_with('/') || path.ends_with('*') {
                verbatim.insert(path);
            } else {
                groups.entry(parent_dir(&path)).or_default().push(path);
            }
        }

        let mut wildcards: BTreeSet<String> = BTreeSet::new();
        let mut explicit: BTreeSet<String> = BTreeSet::new();
        for (dir, files) in groups {
            if files.len() >= self.collapse_threshold {
                wildcards.insert(format!("{dir}*"));
            } else {
                explicit.extend(files);
            }
        }
        for pattern in verbatim {
            if pattern.ends_with('*') {
                wildcards.insert(pattern);
            } else {
                explicit.insert(pattern);
            }
        }

        if wildcards.contains(FULL_PATTERN) {
            return self.full_with_raw(raw_path_count);
        }

        // Drop anything already matched by a broader wildcard
        let prefixes: Vec<String> = wildcards
            .iter()
            .map(|w| w.trim_end_matches('*').to_string())
            .collect();
        let covered = |pattern: &str, own: Option<&str>| {
            prefixes
                .iter()
                .any(|prefix| Some(prefix.as_str()) != own && pattern.starts_with(prefix.as_str()))
        };

        let mut patterns: BTreeSet<String> = BTreeSet::new();
        for wildcard in &wildcards {
            let own = wildcard.trim_end_matches('*');
            if !covered(wildcard, Some(own)) {
                patterns.insert(wildcard.clone());
            }
        }
        for path in explicit {
            if path == "/" || !covered(&path, None) {
                patterns.insert(path);
            }
        }

        if patterns.len() > self.path_ceiling {
            return self.full_with_raw(raw_path_count);
        }

        let patterns: Vec<String> = patterns.into_iter().collect();
        InvalidationPlan {
            estimated_cost_micros: self.cost.estimate(patterns.len()),
            patterns,
            raw_path_count,
        }
    }

    /// A plan that invalidates everything
    pub fn full(&self) -> InvalidationPlan {
        self.full_with_raw(1)
    }

    fn full_with_raw(&self, raw_path_count: usize) -> InvalidationPlan {
        InvalidationPlan {
            patterns: vec![FULL_PATTERN.to_string()],
            estimated_cost_micros: self.cost.estimate(1),
            raw_path_count,
        }
    }
}

/// Leading slash, no surrounding whitespace; empty input is dropped
fn normalize(path: &str) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{trimmed}"))
    }
}

/// `/blog/a.html` → `/blog/`, `/a.html` → `/`
fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..=idx].to_string(),
        None => "/".to_string(),
    }
}
