//! Wildcard operation patterns.

use regex::Regex;
use std::fmt;

/// Compiled operation pattern: `*` matches any substring, everything else is
/// literal, and the whole text must match.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a registration string
    pub fn compile(source: &str) -> Self {
        let body = source
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{}$", body))
            .expect("escaped wildcard pattern always compiles");
        Self {
            source: source.to_string(),
            regex,
        }
    }

    /// Whether `text` matches
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// The registration string
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({:?})", self.source)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
