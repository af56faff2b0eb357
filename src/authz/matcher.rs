//! Wildcard matching of stored Api path patterns against request paths.
//!
//! A pattern is classified once into a [`PathPattern`] and then matched. The
//! wildcard matches any substring, including `/`, so `/api/*/logs` matches
//! both `/api/x/logs` and `/api/a/b/logs`.

use crate::authz::errors::AuthzError;
use crate::authz::types::GLOBAL_WILDCARD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathPattern<'a> {
    /// No wildcard; only the identical path matches.
    Exact(&'a str),
    /// `/*`, matches every path.
    Global,
    /// Trailing wildcard; holds the literal prefix.
    Prefix(&'a str),
    /// Leading wildcard; holds the literal suffix.
    Suffix(&'a str),
    /// One wildcard between two literals.
    Middle { prefix: &'a str, suffix: &'a str },
    /// More than one wildcard. Never matches.
    Unsupported,
}

/// Classify a pattern. Precedence follows the variant order above.
pub fn classify(pattern: &str) -> PathPattern<'_> {
    if pattern == GLOBAL_WILDCARD {
        return PathPattern::Global;
    }
    match pattern.matches('*').count() {
        0 => PathPattern::Exact(pattern),
        1 => {
            if let Some(prefix) = pattern.strip_suffix('*') {
                PathPattern::Prefix(prefix)
            } else if let Some(suffix) = pattern.strip_prefix('*') {
                PathPattern::Suffix(suffix)
            } else {
                match pattern.split_once('*') {
                    Some((prefix, suffix)) => PathPattern::Middle { prefix, suffix },
                    None => PathPattern::Unsupported,
                }
            }
        }
        _ => PathPattern::Unsupported,
    }
}

impl PathPattern<'_> {
    pub fn matches(&self, path: &str) -> bool {
        match *self {
            PathPattern::Exact(p) => p == path,
            PathPattern::Global => true,
            PathPattern::Prefix(prefix) => path.starts_with(prefix),
            PathPattern::Suffix(suffix) => path.ends_with(suffix),
            PathPattern::Middle { prefix, suffix } => {
                path.starts_with(prefix) && path.ends_with(suffix)
            }
            PathPattern::Unsupported => false,
        }
    }
}

/// Does the stored `pattern` grant `path`?
pub fn matches(pattern: &str, path: &str) -> bool {
    pattern == path || classify(pattern).matches(path)
}

/// Reject patterns an Api row may not carry.
pub fn validate_pattern(pattern: &str) -> Result<(), AuthzError> {
    let well_formed = (pattern.starts_with('/') || pattern.starts_with('*'))
        && !pattern.chars().any(char::is_whitespace)
        && classify(pattern) != PathPattern::Unsupported;
    if well_formed {
        Ok(())
    } else {
        Err(AuthzError::MalformedPattern(pattern.to_string()))
    }
}
