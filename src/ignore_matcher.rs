//! Ignore Matcher (spec §4.1): cascading `.sync_ignore` files compiled into a
//! gitignore-style matcher, plus a priority-include (negation) layer and an
//! include-only baseline used by include-pattern scope (§3.3).

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use parking_lot::Mutex;

pub const SYNC_IGNORE_FILENAME: &str = ".sync_ignore";
pub const SYNC_TEMP_DIRNAME: &str = ".sync_temp";

/// Names that are always ignored, anywhere in the tree, regardless of any
/// `.sync_ignore` content.
const DEFAULT_IGNORED_NAMES: &[&str] = &[
    SYNC_TEMP_DIRNAME,
    "make-sync.yaml",
    SYNC_IGNORE_FILENAME,
    ".sync_collections",
];

struct CompiledDir {
    /// The cascade of every `.sync_ignore` line from the root down to this
    /// directory, root-first, negations included.
    cascade: Gitignore,
    /// Only the negated (`!pattern`) lines from the same cascade, compiled as
    /// plain (non-negated) patterns so a match means "this path was named by
    /// a `!` rule".
    priority_include: Gitignore,
}

/// Compiles `.sync_ignore` files rooted at `root` into a cascading matcher.
pub struct IgnoreMatcher {
    root: PathBuf,
    cache: Mutex<HashMap<PathBuf, Arc<CompiledDir>>>,
}

impl IgnoreMatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Is `path` always ignored, independent of `.sync_ignore` content?
    ///
    /// `.sync_temp` is never rescued by a priority-include rule; the other
    /// default-ignored names can be.
    pub fn is_sync_temp(path: &Path) -> bool {
        path.components()
            .any(|c| c == Component::Normal(SYNC_TEMP_DIRNAME.as_ref()))
    }

    fn is_default_ignored(path: &Path) -> bool {
        path.components().any(|c| match c {
            Component::Normal(name) => DEFAULT_IGNORED_NAMES
                .iter()
                .any(|n| name == std::ffi::OsStr::new(n)),
            _ => false,
        })
    }

    /// Decide whether `path` (with the given directory-ness) is ignored.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        if Self::is_sync_temp(path) {
            return true;
        }

        let dir = if is_dir {
            path
        } else {
            path.parent().unwrap_or(&self.root)
        };
        let compiled = self.compiled_for(dir);

        let default_hit = Self::is_default_ignored(path);
        let rescued = compiled
            .priority_include
            .matched(path, is_dir)
            .is_ignore();

        if rescued {
            return false;
        }
        if default_hit {
            return true;
        }
        compiled.cascade.matched(path, is_dir).is_ignore()
    }

    fn compiled_for(&self, dir: &Path) -> Arc<CompiledDir> {
        if let Some(hit) = self.cache.lock().get(dir) {
            return hit.clone();
        }

        let compiled = Arc::new(self.compile(dir));
        self.cache.lock().insert(dir.to_path_buf(), compiled.clone());
        compiled
    }

    fn ancestor_chain(&self, dir: &Path) -> Vec<PathBuf> {
        let mut chain = Vec::new();
        let mut cur = dir.to_path_buf();
        loop {
            chain.push(cur.clone());
            if cur == self.root {
                break;
            }
            match cur.parent() {
                Some(parent) if parent.starts_with(&self.root) || parent == self.root => {
                    cur = parent.to_path_buf();
                }
                _ => break,
            }
        }
        chain.reverse();
        chain
    }

    fn compile(&self, dir: &Path) -> CompiledDir {
        let mut lines = Vec::new();
        for ancestor in self.ancestor_chain(dir) {
            let candidate = ancestor.join(SYNC_IGNORE_FILENAME);
            let Ok(contents) = fs::read_to_string(&candidate) else {
                continue;
            };
            for line in contents.lines() {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                lines.push(trimmed.to_string());
            }
        }
        compile_pattern_lines(&self.root, &lines)
    }
}

/// Builds a [`CompiledDir`] (cascade + priority-include) from an already
/// flattened list of pattern lines, shared by the local cascading matcher
/// ([`IgnoreMatcher::compile`]) and [`RemoteIgnoreMatcher`], which applies
/// the same decision logic to the pre-expanded `ignores` array the remote
/// agent receives (spec §4.3: "the agent applies these directly").
fn compile_pattern_lines(root: &Path, lines: &[String]) -> CompiledDir {
    let mut cascade_builder = GitignoreBuilder::new(root);
    let mut negations = Vec::new();

    for trimmed in lines {
        // GitignoreBuilder::add_line rejects lines containing a bare "\n";
        // feed one physical line at a time.
        let _ = cascade_builder.add_line(None, trimmed);
        if let Some(stripped) = trimmed.strip_prefix('!') {
            negations.push(stripped.to_string());
        }
    }

    let cascade = cascade_builder.build().unwrap_or_else(|_| {
        GitignoreBuilder::new(root)
            .build()
            .expect("empty gitignore builder never fails")
    });

    let mut priority_builder = GitignoreBuilder::new(root);
    for pattern in &negations {
        let _ = priority_builder.add_line(None, pattern);
    }
    let priority_include = priority_builder.build().unwrap_or_else(|_| {
        GitignoreBuilder::new(root)
            .build()
            .expect("empty gitignore builder never fails")
    });

    CompiledDir {
        cascade,
        priority_include,
    }
}

/// The remote agent's ignore matcher (spec §4.3): unlike [`IgnoreMatcher`],
/// it never reads `.sync_ignore` files from disk — it is built once from the
/// flat, pre-expanded `ignores` array uploaded in `config.json`, and applies
/// the exact same default-ignored-names / priority-include decision as the
/// local cascade.
pub struct RemoteIgnoreMatcher {
    compiled: CompiledDir,
}

impl RemoteIgnoreMatcher {
    pub fn from_patterns(root: impl AsRef<Path>, patterns: &[String]) -> Self {
        Self {
            compiled: compile_pattern_lines(root.as_ref(), patterns),
        }
    }

    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        if IgnoreMatcher::is_sync_temp(path) {
            return true;
        }
        let default_hit = IgnoreMatcher::is_default_ignored(path);
        let rescued = self
            .compiled
            .priority_include
            .matched(path, is_dir)
            .is_ignore();
        if rescued {
            return false;
        }
        if default_hit {
            return true;
        }
        self.compiled.cascade.matched(path, is_dir).is_ignore()
    }
}

/// The include-only matcher used by include-pattern scope (§3.3, §4.1): a
/// baseline that ignores everything, then unignores each `!`-pattern drawn
/// from `.sync_ignore` plus its `**/`-prepended form.
pub struct IncludeMatcher {
    matcher: Gitignore,
}

impl IncludeMatcher {
    /// `bang_patterns` are already stripped of their leading `!` (the raw
    /// pattern text that followed it in `.sync_ignore`).
    pub fn from_patterns(root: impl AsRef<Path>, bang_patterns: &[String]) -> Self {
        let mut builder = GitignoreBuilder::new(root.as_ref());
        let _ = builder.add_line(None, "**");
        for pattern in bang_patterns {
            let _ = builder.add_line(None, &format!("!{pattern}"));
            let _ = builder.add_line(None, &format!("!**/{pattern}"));
        }
        let matcher = builder.build().unwrap_or_else(|_| {
            GitignoreBuilder::new(root.as_ref())
                .build()
                .expect("empty gitignore builder never fails")
        });
        Self { matcher }
    }

    /// A path is in include-scope iff this matcher reports it as *not*
    /// ignored (and it isn't under `.sync_temp`).
    pub fn is_in_scope(&self, path: &Path, is_dir: bool) -> bool {
        if IgnoreMatcher::is_sync_temp(path) {
            return false;
        }
        !self.matcher.matched(path, is_dir).is_ignore()
    }
}

/// Extracts the `!`-prefixed lines (stripped of `!`) from a single
/// `.sync_ignore` file's raw text. Used to build the include-only matcher
/// from a flat, pre-expanded pattern list (spec §4.3 config contract: the
/// agent receives patterns already expanded by the local side).
pub fn extract_bang_patterns(sync_ignore_contents: &str) -> Vec<String> {
    sync_ignore_contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.strip_prefix('!'))
        .map(str::to_string)
        .collect()
}

/// Expands a single raw ignore pattern into its two effective forms when it
/// is "bare" (no `/` and no `**`), matching §4.1's bare-pattern rule. This is
/// what the local side runs before uploading the `ignores` array to the
/// remote agent, so the agent never has to re-implement the rule itself.
pub fn expand_bare_pattern(pattern: &str) -> Vec<String> {
    let body = pattern.strip_prefix('!').unwrap_or(pattern);
    let negated = pattern.starts_with('!');
    let is_bare = !body.contains('/') && !body.contains("**");
    let prefix = if negated { "!" } else { "" };
    if is_bare {
        vec![
            format!("{prefix}{body}"),
            format!("{prefix}**/{body}"),
        ]
    } else {
        vec![pattern.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn bare_pattern_matches_any_depth() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, ".sync_ignore", "secret.key\n");
        write(root, "secret.key", "k");
        write(root, "nested/secret.key", "k");
        let matcher = IgnoreMatcher::new(root);
        assert!(matcher.is_ignored(&root.join("secret.key"), false));
        assert!(matcher.is_ignored(&root.join("nested/secret.key"), false));
    }

    #[test]
    fn sync_temp_is_never_rescued() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, ".sync_ignore", "!.sync_temp\n!.sync_temp/**\n");
        let matcher = IgnoreMatcher::new(root);
        assert!(matcher.is_ignored(&root.join(".sync_temp/indexing_files.db"), false));
    }

    #[test]
    fn negation_rescues_default_ignored_name() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, ".sync_ignore", "!make-sync.yaml\n");
        write(root, "make-sync.yaml", "x");
        let matcher = IgnoreMatcher::new(root);
        assert!(!matcher.is_ignored(&root.join("make-sync.yaml"), false));
    }

    #[test]
    fn cascade_combines_ancestor_files_root_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, ".sync_ignore", "*.log\n");
        write(root, "sub/.sync_ignore", "*.tmp\n");
        write(root, "sub/a.log", "x");
        write(root, "sub/a.tmp", "x");
        write(root, "sub/a.keep", "x");
        let matcher = IgnoreMatcher::new(root);
        assert!(matcher.is_ignored(&root.join("sub/a.log"), false));
        assert!(matcher.is_ignored(&root.join("sub/a.tmp"), false));
        assert!(!matcher.is_ignored(&root.join("sub/a.keep"), false));
    }

    #[test]
    fn include_matcher_admits_only_bang_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let patterns = vec!["docker-compose.yml".to_string()];
        let matcher = IncludeMatcher::from_patterns(root, &patterns);
        assert!(matcher.is_in_scope(&root.join("docker-compose.yml"), false));
        assert!(!matcher.is_in_scope(&root.join("app.py"), false));
    }

    #[test]
    fn include_matcher_excludes_sync_temp_even_if_listed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let patterns = vec![".sync_temp".to_string()];
        let matcher = IncludeMatcher::from_patterns(root, &patterns);
        assert!(!matcher.is_in_scope(&root.join(".sync_temp/indexing_files.db"), false));
    }

    #[test]
    fn expand_bare_pattern_doubles_bare_patterns_only() {
        assert_eq!(
            expand_bare_pattern("secret.key"),
            vec!["secret.key".to_string(), "**/secret.key".to_string()]
        );
        assert_eq!(
            expand_bare_pattern("dir/file"),
            vec!["dir/file".to_string()]
        );
        assert_eq!(
            expand_bare_pattern("!secret.key"),
            vec!["!secret.key".to_string(), "!**/secret.key".to_string()]
        );
    }

    #[test]
    fn remote_ignore_matcher_applies_pre_expanded_patterns_directly() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let patterns = vec!["secret.key".to_string(), "**/secret.key".to_string()];
        let matcher = RemoteIgnoreMatcher::from_patterns(root, &patterns);
        assert!(matcher.is_ignored(&root.join("nested/secret.key"), false));
        assert!(!matcher.is_ignored(&root.join("app.py"), false));
    }

    #[test]
    fn remote_ignore_matcher_never_rescues_sync_temp() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let patterns = vec!["!.sync_temp".to_string(), "!.sync_temp/**".to_string()];
        let matcher = RemoteIgnoreMatcher::from_patterns(root, &patterns);
        assert!(matcher.is_ignored(&root.join(".sync_temp/indexing_files.db"), false));
    }
}
