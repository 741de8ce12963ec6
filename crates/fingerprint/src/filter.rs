//! Include/exclude glob filters shared by fingerprinting, copying, and
//! staging cache keys.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

/// Glob filters selecting which entries of a directory tree participate in
/// fingerprinting and copying.
///
/// An empty `include` list selects everything. `exclude` patterns win over
/// `include` patterns, and an excluded directory prunes its whole subtree.
/// Include patterns apply to non-directory entries only; directories are
/// always traversed unless excluded, so `**/*.rs` still reaches nested
/// files.
///
/// The set is serializable because it is part of the observable staging
/// configuration: it folds into both content fingerprints and cache keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    /// Patterns selecting entries to keep. Empty means keep everything.
    #[serde(default)]
    pub include: Vec<String>,
    /// Patterns selecting entries to drop. Applied before `include`.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl FilterSet {
    /// A filter set that selects everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter set with only exclusion patterns.
    #[must_use]
    pub fn excluding<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: Vec::new(),
            exclude: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Compile the patterns into a reusable matcher.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] if any glob fails to parse.
    pub fn matcher(&self) -> Result<FilterMatcher> {
        let include = if self.include.is_empty() {
            None
        } else {
            Some(build_set(&self.include)?)
        };
        Ok(FilterMatcher {
            include,
            exclude: build_set(&self.exclude)?,
        })
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| Error::InvalidPattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| Error::InvalidPattern {
        pattern: patterns.join(","),
        reason: e.to_string(),
    })
}

/// Compiled form of a [`FilterSet`].
#[derive(Debug, Clone)]
pub struct FilterMatcher {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl FilterMatcher {
    /// Whether traversal may visit the entry at `rel`. Only exclusion
    /// applies here; include patterns never prune directories.
    #[must_use]
    pub fn descends_into(&self, rel: &Path) -> bool {
        !self.exclude.is_match(rel)
    }

    /// Whether the non-directory entry at `rel` is selected.
    #[must_use]
    pub fn selects(&self, rel: &Path) -> bool {
        if self.exclude.is_match(rel) {
            return false;
        }
        self.include
            .as_ref()
            .is_none_or(|include| include.is_match(rel))
    }
}
