use glob::{MatchOptions, Pattern};
use regex::Regex;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Glob dialect shared by watched patterns and exclude lists: `*` stays
/// within one path component, `**` spans any number of directories.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Decides which globbed files a path watcher actually tails
#[derive(Clone, Default)]
pub struct PathFilter {
    /// Accept a path if any of these match (empty = accept all)
    include: Vec<Regex>,

    /// Reject a path if any of these match, regardless of `include`
    exclude: Vec<Pattern>,
}

impl PathFilter {
    /// A filter that accepts every path
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an accepted-path regex
    pub fn with_include(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.include.push(Regex::new(pattern)?);
        Ok(self)
    }

    /// Add exclude globs
    pub fn with_excludes<I, S>(mut self, globs: I) -> Result<Self, glob::PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for glob in globs {
            self.exclude.push(Pattern::new(glob.as_ref())?);
        }
        Ok(self)
    }

    /// Check if a path should be tailed
    pub fn accepts(&self, path: &Path) -> bool {
        if self
            .exclude
            .iter()
            .any(|pattern| pattern.matches_path_with(path, MATCH_OPTIONS))
        {
            return false;
        }

        if self.include.is_empty() {
            return true;
        }
        let text = path.to_string_lossy();
        self.include.iter().any(|re| re.is_match(&text))
    }
}

impl std::fmt::Debug for PathFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathFilter")
            .field(
                "include",
                &self.include.iter().map(Regex::as_str).collect::<Vec<_>>(),
            )
            .field(
                "exclude",
                &self.exclude.iter().map(Pattern::as_str).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Expand a glob into the regular files it currently matches, sorted
pub fn expand(pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError> {
    let mut files: Vec<PathBuf> = glob::glob_with(pattern, MATCH_OPTIONS)?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(error) => {
                debug!(%error, "skipping unreadable glob entry");
                None
            }
        })
        .filter(|path| !path.is_dir())
        .collect();
    files.sort();
    Ok(files)
}
