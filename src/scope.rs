//! ScopeSelector (spec §3.3): what portion of the tree an operation covers.

use std::path::Path;

use crate::ignore_matcher::IncludeMatcher;

#[derive(Debug, Clone)]
pub enum ScopeSelector {
    /// The entire root.
    Full,
    /// A set of forward-slash relative prefixes. An entry is in scope iff
    /// its `rel` equals, or is under, any prefix. An empty prefix matches
    /// everything.
    Prefixes(Vec<String>),
}

impl ScopeSelector {
    pub fn prefixes(raw: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Prefixes(raw.into_iter().map(Into::into).collect())
    }

    /// Is `rel` in scope under a prefix/full selector? Include-pattern scope
    /// is evaluated separately via [`IncludeMatcher`] since it needs the
    /// entry's directory-ness and full path, not just `rel`.
    pub fn contains(&self, rel: &str) -> bool {
        match self {
            ScopeSelector::Full => true,
            ScopeSelector::Prefixes(prefixes) => prefixes.iter().any(|p| prefix_contains(p, rel)),
        }
    }
}

fn prefix_contains(prefix: &str, rel: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    rel == prefix || rel.starts_with(&format!("{prefix}/"))
}

/// The full scope decision for one operation: either a [`ScopeSelector`]
/// (Full or Prefixes) or an include-pattern matcher (§3.3's third variant).
pub enum Scope {
    Selector(ScopeSelector),
    Include(IncludeMatcher),
}

impl Scope {
    pub fn contains_rel(&self, rel: &str, path: &Path, is_dir: bool) -> bool {
        match self {
            Scope::Selector(s) => s.contains(rel),
            Scope::Include(m) => m.is_in_scope(path, is_dir),
        }
    }

    pub fn is_include(&self) -> bool {
        matches!(self, Scope::Include(_))
    }
}
