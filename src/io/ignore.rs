use anyhow::{Context, Result};
use regex::Regex;
use std::path::Path;

/// Ignore rules matched against paths relative to the watched root.
///
/// A pattern without glob characters is a path prefix (`target` matches
/// `target/debug/x`). A pattern with `*`, `?` or `[` is a glob where `*`
/// stays inside one segment and `**` crosses segments. Globs without a `/`
/// are also tried against every single path segment, so `*.lock` ignores
/// `deps/Cargo.lock`.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    prefixes: Vec<String>,
    globs: Vec<CompiledGlob>,
}

#[derive(Debug, Clone)]
struct CompiledGlob {
    regex: Regex,
    segment_only: bool,
}

impl IgnoreSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut set = Self::default();
        for raw in patterns {
            let pattern = raw.as_ref().trim().trim_start_matches("./");
            if pattern.is_empty() {
                continue;
            }
            if pattern.contains(['*', '?', '[']) {
                let trimmed = pattern.trim_end_matches('/');
                let regex = Regex::new(&glob_to_regex(trimmed))
                    .with_context(|| format!("Invalid ignore pattern: {}", pattern))?;
                set.globs.push(CompiledGlob {
                    regex,
                    segment_only: !trimmed.contains('/'),
                });
            } else {
                set.prefixes
                    .push(pattern.trim_end_matches('/').to_string());
            }
        }
        Ok(set)
    }

    pub fn is_ignored(&self, relative: &Path) -> bool {
        let normalized = relative.to_string_lossy().replace('\\', "/");
        let path = normalized.trim_start_matches("./");
        if path.is_empty() {
            return false;
        }

        if self
            .prefixes
            .iter()
            .any(|p| path == p || path.starts_with(&format!("{}/", p)))
        {
            return true;
        }

        // A glob matching any ancestor directory hides everything below it.
        let segments: Vec<&str> = path.split('/').collect();
        self.globs.iter().any(|glob| {
            if glob.segment_only {
                return segments.iter().any(|s| glob.regex.is_match(s));
            }
            (1..=segments.len()).any(|n| glob.regex.is_match(&segments[..n].join("/")))
        })
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                // `**/` also matches zero directories
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                if let Some(end) = chars[i + 1..].iter().position(|&c| c == ']') {
                    let class: String = chars[i + 1..i + 1 + end].iter().collect();
                    out.push('[');
                    match class.strip_prefix('!') {
                        Some(negated) => {
                            out.push('^');
                            out.push_str(negated);
                        }
                        None => out.push_str(&class),
                    }
                    out.push(']');
                    i += end + 2;
                    continue;
                }
                out.push_str("\\[");
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}
