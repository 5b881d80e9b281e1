//! Key patterns used by `keys`, `search` and `hkeys`.

use regex::Regex;

use crate::error::Result;

/// A key filter: either a shell-style wildcard or a raw regular expression.
///
/// Wildcards are anchored at both ends. `*` matches one or more characters,
/// `?` matches exactly one, every other character matches itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    /// `user:*`, `session:??`
    Wildcard(String),
    /// Unanchored regular expression, e.g. `^user:\d+$`
    Regex(String),
}

impl KeyPattern {
    /// Shorthand for [`KeyPattern::Wildcard`]
    pub fn wildcard(pattern: impl Into<String>) -> Self {
        KeyPattern::Wildcard(pattern.into())
    }

    /// Shorthand for [`KeyPattern::Regex`]
    pub fn regex(pattern: impl Into<String>) -> Self {
        KeyPattern::Regex(pattern.into())
    }

    /// Pattern matching keys that start with `prefix`
    pub fn prefix(prefix: &str) -> Self {
        KeyPattern::Regex(format!("^{}", regex::escape(prefix)))
    }

    /// Compiles the pattern.
    pub fn compile(&self) -> Result<Regex> {
        let regex = match self {
            KeyPattern::Wildcard(pattern) => Regex::new(&wildcard_to_regex(pattern))?,
            KeyPattern::Regex(pattern) => Regex::new(pattern)?,
        };
        Ok(regex)
    }
}

/// Translates a wildcard into an anchored regular expression
pub fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if c == '*' { ".+" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    out.push_str(&regex::escape(&literal));
    out.push('$');
    out
}
