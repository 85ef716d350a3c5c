//! Glob patterns over commit file paths.
//!
//! Globs are anchored to the whole path. `*` matches within one path
//! segment, `**` crosses segments, `?` matches a single character, and
//! `[...]` character classes pass through. Every wildcard becomes a regex
//! capture group so `join_on`/`group_by` templates can refer to `$1`, `$2`,
//! and so on.

use regex::Regex;
use std::fmt;

/// A compiled glob pattern.
#[derive(Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    /// Compile a glob. Patterns are rooted; a missing leading `/` is added.
    pub fn compile(pattern: &str) -> crate::Result<Self> {
        if pattern.is_empty() {
            return Err(crate::Error::InvalidGlob {
                pattern: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }
        let rooted = if pattern.starts_with('/') {
            pattern.to_string()
        } else {
            format!("/{pattern}")
        };

        let mut re = String::from("^");
        let mut chars = rooted.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        re.push_str("(.*)");
                    } else {
                        re.push_str("([^/]*)");
                    }
                }
                '?' => re.push_str("([^/])"),
                '[' => {
                    re.push('(');
                    re.push('[');
                    let mut closed = false;
                    for c in chars.by_ref() {
                        re.push(c);
                        if c == ']' {
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(crate::Error::InvalidGlob {
                            pattern: pattern.to_string(),
                            reason: "unclosed character class".to_string(),
                        });
                    }
                    re.push(')');
                }
                c if "\\.+()|{}^$".contains(c) => {
                    re.push('\\');
                    re.push(c);
                }
                c => re.push(c),
            }
        }
        re.push('$');

        let regex = Regex::new(&re).map_err(|e| crate::Error::InvalidGlob {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            pattern: rooted,
            regex,
        })
    }

    /// The normalized (rooted) pattern text.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the pattern is exactly `/`, matching the repo root as one unit.
    pub fn is_root(&self) -> bool {
        self.pattern == "/"
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Capture groups for a matching path, one per wildcard, in order.
    pub fn captures(&self, path: &str) -> Option<Vec<String>> {
        let caps = self.regex.captures(path)?;
        Some(
            (1..caps.len())
                .map(|i| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }

    /// Expand a `$N` template against this glob's captures of `path`.
    ///
    /// Used by join/group keys: `join_on = "$1"` buckets paths by their
    /// first wildcard capture. Returns `None` if the path does not match.
    pub fn expand(&self, template: &str, path: &str) -> Option<String> {
        let caps = self.captures(path)?;
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let mut num = String::new();
            while let Some(d) = chars.peek() {
                if d.is_ascii_digit() {
                    num.push(*d);
                    chars.next();
                } else {
                    break;
                }
            }
            match num.parse::<usize>() {
                Ok(n) if n >= 1 && n <= caps.len() => out.push_str(&caps[n - 1]),
                _ => out.push('$'),
            }
        }
        Some(out)
    }
}

impl fmt::Debug for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Glob({})", self.pattern)
    }
}

impl fmt::Display for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}
