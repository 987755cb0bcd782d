//! `.carteignore` pattern matching for `COPY` sources.
//!
//! Patterns are matched against context-relative paths with `/`
//! separators. `*` and `?` do not cross `/`, `**` does. A pattern that
//! matches a directory excludes everything beneath it. A leading `!`
//! re-includes, and the last matching pattern wins.

use std::path::Path;

use carte_common::constants::IGNORE_FILE;
use carte_common::error::{CarteError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    glob: String,
    negate: bool,
}

/// Compiled ignore rules for one build context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    /// Loads `.carteignore` from the context root; missing file means no rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn load(context_dir: &Path) -> Result<Self> {
        let path = context_dir.join(IGNORE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(CarteError::io(path, e)),
        }
    }

    /// Parses rules from file content.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let patterns = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|line| {
                let (negate, body) = line
                    .strip_prefix('!')
                    .map_or((false, line), |rest| (true, rest.trim()));
                let glob = body
                    .trim_start_matches("./")
                    .trim_start_matches('/')
                    .trim_end_matches('/')
                    .to_string();
                Pattern { glob, negate }
            })
            .filter(|p| !p.glob.is_empty())
            .collect();
        Self { patterns }
    }

    /// Returns true if `rel_path` (relative to the context root) is excluded.
    #[must_use]
    pub fn is_ignored(&self, rel_path: &str) -> bool {
        let rel_path = rel_path.trim_start_matches("./").trim_matches('/');
        let mut ignored = false;
        for pattern in &self.patterns {
            if prefixes(rel_path).any(|prefix| glob_match(&pattern.glob, prefix)) {
                ignored = !pattern.negate;
            }
        }
        ignored
    }
}

/// The path itself and each of its ancestor directories.
fn prefixes(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .filter(|(_, c)| *c == '/')
        .map(|(i, _)| &path[..i])
        .chain(std::iter::once(path))
}

/// Shell-style glob match over `/`-separated paths.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    match_from(&p, &t)
}

fn match_from(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') if p.get(1) == Some(&'*') => {
            let rest = p[2..].strip_prefix(&['/']).unwrap_or(&p[2..]);
            (0..=t.len()).any(|i| match_from(rest, &t[i..]))
        }
        Some('*') => {
            let rest = &p[1..];
            for i in 0..=t.len() {
                if match_from(rest, &t[i..]) {
                    return true;
                }
                if t.get(i) == Some(&'/') {
                    break;
                }
            }
            false
        }
        Some('?') => t.first().is_some_and(|c| *c != '/') && match_from(&p[1..], &t[1..]),
        Some(c) => t.first() == Some(c) && match_from(&p[1..], &t[1..]),
    }
}
