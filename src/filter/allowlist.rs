//! Allowlist of permitted domain names.
//!
//! Holds an ordered list of compiled regular expressions. The built-in set is
//! loaded at compile time; there is no way to change it at runtime.

use regex::Regex;
use thiserror::Error;
use tracing::trace;

/// Embedded allowlist patterns, loaded at compile time.
const PATTERNS_LIST: &str = include_str!("patterns.txt");

#[derive(Debug, Error)]
pub enum AllowlistError {
    #[error("invalid allowlist pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// An ordered set of domain name patterns.
///
/// Built once before serving and shared read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct Allowlist {
    patterns: Vec<Regex>,
}

impl Allowlist {
    /// Create an empty allowlist that permits nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allowlist from the embedded pattern list.
    pub fn builtin() -> Result<Self, AllowlistError> {
        let mut allowlist = Self::new();

        for line in PATTERNS_LIST.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            allowlist.add(line)?;
        }

        Ok(allowlist)
    }

    /// Compile `pattern` and append it after the existing patterns.
    pub fn add(&mut self, pattern: &str) -> Result<(), AllowlistError> {
        let regex = Regex::new(pattern).map_err(|source| AllowlistError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.patterns.push(regex);

        Ok(())
    }

    /// Returns the first pattern, in registration order, that matches `domain`.
    pub fn matching_pattern(&self, domain: &str) -> Option<&str> {
        for regex in &self.patterns {
            trace!(domain, pattern = regex.as_str(), "trying allowlist pattern");
            if regex.is_match(domain) {
                return Some(regex.as_str());
            }
        }

        None
    }

    /// Check if a domain is permitted. Matching is case sensitive.
    pub fn is_allowed(&self, domain: &str) -> bool {
        self.matching_pattern(domain).is_some()
    }

    /// Returns the number of patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
