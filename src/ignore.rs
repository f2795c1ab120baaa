/// Ignore Matcher Module
///
/// Evaluates `.swarmignore` patterns (reduced gitignore semantics) plus the
/// user's explicit excluded-folder list. Patterns are applied in file order
/// and the last match wins; matching is case-insensitive over forward-slash
/// paths. The ignore file is reloaded whenever its mtime changes, checked
/// lazily on each query.
///
/// Supported syntax: blank lines and `#` comments are skipped, `!` negates,
/// a trailing `/` restricts to directories, a `/` anywhere else anchors the
/// pattern to the sync root, `**` crosses segments, `*` stays within one,
/// `?` matches a single character.
use glob::{MatchOptions, Pattern};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::SystemTime;

/// Name of the user-editable ignore file at the sync root.
pub const IGNORE_FILE_NAME: &str = ".swarmignore";

/// Internal directories that are never synced regardless of patterns.
const ALWAYS_IGNORED_DIRS: &[&str] = &[".swarm", ".swarm-vault"];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct IgnorePattern {
    pattern: Pattern,
    negate: bool,
    dir_only: bool,
    anchored: bool,
}

impl IgnorePattern {
    fn parse(line: &str) -> Option<Self> {
        let mut text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            return None;
        }
        let negate = if let Some(rest) = text.strip_prefix('!') {
            text = rest;
            true
        } else {
            false
        };
        let dir_only = if let Some(rest) = text.strip_suffix('/') {
            text = rest;
            true
        } else {
            false
        };
        let anchored = if let Some(rest) = text.strip_prefix('/') {
            text = rest;
            true
        } else {
            // A slash anywhere else also anchors to the root.
            text.contains('/')
        };
        let pattern = Pattern::new(text).ok()?;
        Some(Self { pattern, negate, dir_only, anchored })
    }

    /// Whether this pattern matches `path` (forward-slash relative).
    fn matches(&self, path: &str, is_dir: bool) -> bool {
        if self.anchored {
            if self.pattern.matches_with(path, MATCH_OPTIONS) {
                return !self.dir_only || is_dir;
            }
            // A matching ancestor directory ignores everything beneath it.
            for (idx, _) in path.match_indices('/') {
                if self.pattern.matches_with(&path[..idx], MATCH_OPTIONS) {
                    return true;
                }
            }
            false
        } else {
            let mut components = path.split('/').peekable();
            while let Some(component) = components.next() {
                let last = components.peek().is_none();
                if self.pattern.matches_with(component, MATCH_OPTIONS) {
                    // Non-final components are directories by construction.
                    if !last || !self.dir_only || is_dir {
                        return true;
                    }
                }
            }
            false
        }
    }
}

#[derive(Debug, Default)]
struct LoadedPatterns {
    patterns: Vec<IgnorePattern>,
    mtime: Option<SystemTime>,
}

/// Matcher over the sync root's `.swarmignore` plus an excluded-folder list.
pub struct IgnoreMatcher {
    ignore_file: PathBuf,
    excluded_folders: RwLock<Vec<String>>,
    loaded: RwLock<LoadedPatterns>,
}

impl IgnoreMatcher {
    pub fn new(sync_root: &std::path::Path, excluded_folders: Vec<String>) -> Self {
        Self {
            ignore_file: sync_root.join(IGNORE_FILE_NAME),
            excluded_folders: RwLock::new(
                excluded_folders.iter().map(|f| normalize(f)).collect(),
            ),
            loaded: RwLock::new(LoadedPatterns::default()),
        }
    }

    /// Replace the excluded-folder list (config changes at runtime).
    pub fn set_excluded_folders(&self, folders: Vec<String>) {
        *self.excluded_folders.write().unwrap() =
            folders.iter().map(|f| normalize(f)).collect();
    }

    /// Whether `relative_path` should be excluded from syncing.
    pub fn is_ignored(&self, relative_path: &str, is_dir: bool) -> bool {
        let path = normalize(relative_path);
        if path.is_empty() {
            return false;
        }

        // Daemon internals are unconditionally excluded.
        for component in path.split('/') {
            if ALWAYS_IGNORED_DIRS.iter().any(|d| component.eq_ignore_ascii_case(d)) {
                return true;
            }
        }

        // Explicit folder exclusions short-circuit the pattern list.
        {
            let excluded = self.excluded_folders.read().unwrap();
            for folder in excluded.iter() {
                if eq_ci(&path, folder) || starts_with_ci(&path, &format!("{}/", folder)) {
                    return true;
                }
            }
        }

        self.reload_if_stale();
        let loaded = self.loaded.read().unwrap();
        let mut decision = false;
        for pat in &loaded.patterns {
            if pat.matches(&path, is_dir) {
                decision = !pat.negate;
            }
        }
        decision
    }

    fn reload_if_stale(&self) {
        let current_mtime = std::fs::metadata(&self.ignore_file)
            .and_then(|m| m.modified())
            .ok();
        {
            let loaded = self.loaded.read().unwrap();
            if loaded.mtime == current_mtime && (current_mtime.is_some() || loaded.patterns.is_empty())
            {
                return;
            }
        }
        let patterns = match std::fs::read_to_string(&self.ignore_file) {
            Ok(text) => text.lines().filter_map(IgnorePattern::parse).collect(),
            Err(_) => Vec::new(),
        };
        let mut loaded = self.loaded.write().unwrap();
        loaded.patterns = patterns;
        loaded.mtime = current_mtime;
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn starts_with_ci(path: &str, prefix: &str) -> bool {
    path.len() >= prefix.len() && path[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn matcher_with(dir: &tempfile::TempDir, contents: &str) -> IgnoreMatcher {
        fs::write(dir.path().join(IGNORE_FILE_NAME), contents).unwrap();
        IgnoreMatcher::new(dir.path(), Vec::new())
    }

    #[test]
    fn negation_reincludes_kept_file() {
        let dir = tempfile::tempdir().unwrap();
        let m = matcher_with(&dir, "*.tmp\n!keep.tmp\n");
        assert!(m.is_ignored("scratch.tmp", false));
        assert!(!m.is_ignored("keep.tmp", false));
        assert!(m.is_ignored("nested/dir/other.tmp", false));
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let m = matcher_with(&dir, "# comment\n\n*.log\n");
        assert!(m.is_ignored("a.log", false));
        assert!(!m.is_ignored("a.txt", false));
    }

    #[test]
    fn trailing_slash_restricts_to_directories() {
        let dir = tempfile::tempdir().unwrap();
        let m = matcher_with(&dir, "build/\n");
        assert!(m.is_ignored("build", true));
        assert!(!m.is_ignored("build", false));
        // Contents of an ignored directory are ignored too
        assert!(m.is_ignored("build/out.o", false));
    }

    #[test]
    fn slash_anchors_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let m = matcher_with(&dir, "/top.txt\ndocs/*.md\n");
        assert!(m.is_ignored("top.txt", false));
        assert!(!m.is_ignored("sub/top.txt", false));
        assert!(m.is_ignored("docs/readme.md", false));
        assert!(!m.is_ignored("other/docs/readme.md", false));
    }

    #[test]
    fn double_star_crosses_segments() {
        let dir = tempfile::tempdir().unwrap();
        let m = matcher_with(&dir, "logs/**/*.txt\n");
        assert!(m.is_ignored("logs/a/b/c.txt", false));
        assert!(!m.is_ignored("logs.txt", false));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let m = matcher_with(&dir, "*.TMP\n");
        assert!(m.is_ignored("notes.tmp", false));
    }

    #[test]
    fn last_match_wins_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let m = matcher_with(&dir, "!a.txt\na.txt\n");
        assert!(m.is_ignored("a.txt", false));
        let m2 = matcher_with(&dir, "a.txt\n!a.txt\n");
        assert!(!m2.is_ignored("a.txt", false));
    }

    #[test]
    fn internals_always_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let m = IgnoreMatcher::new(dir.path(), Vec::new());
        assert!(m.is_ignored(".swarm/state.db", false));
        assert!(m.is_ignored(".swarm-vault", true));
        assert!(m.is_ignored("secret/.swarm-vault/config.json", false));
        assert!(!m.is_ignored("normal.txt", false));
    }

    #[test]
    fn excluded_folders_short_circuit() {
        let dir = tempfile::tempdir().unwrap();
        let m = IgnoreMatcher::new(dir.path(), vec!["Private".to_string()]);
        assert!(m.is_ignored("private/diary.txt", false));
        assert!(m.is_ignored("Private", true));
        assert!(!m.is_ignored("public/readme.txt", false));
    }

    #[test]
    fn reloads_when_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let m = matcher_with(&dir, "*.tmp\n");
        assert!(m.is_ignored("x.tmp", false));

        // Rewrite with different rules and a bumped mtime
        let path = dir.path().join(IGNORE_FILE_NAME);
        fs::write(&path, "*.bak\n").unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(2);
        let _ = filetime_set(&path, later);

        assert!(m.is_ignored("x.bak", false));
        assert!(!m.is_ignored("x.tmp", false));
    }

    // Minimal mtime bump helper; falls back to a second write if the
    // platform rejects explicit timestamps.
    fn filetime_set(path: &std::path::Path, _t: SystemTime) -> std::io::Result<()> {
        let f = fs::OpenOptions::new().append(true).open(path)?;
        f.set_modified(SystemTime::now() + std::time::Duration::from_secs(2))?;
        Ok(())
    }
}
