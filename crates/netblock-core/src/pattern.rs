//! Blacklist pattern compilation and matching.
//!
//! Every blacklist entry compiles to exactly one [`Pattern`]. The kind is
//! chosen purely from the entry's syntax:
//!
//! | Entry          | Kind                               | Matches                          |
//! |----------------|------------------------------------|----------------------------------|
//! | `example.com`  | [`PatternKind::Exact`]             | `example.com`, `*.example.com`   |
//! | `*.example.com`| [`PatternKind::PrefixWildcard`]    | `*.example.com` only             |
//! | `google.*`     | [`PatternKind::SuffixWildcard`]    | `google.<any>`, `*.google.<any>` |
//! | `*.google.*`   | [`PatternKind::DoubleWildcard`]    | anything containing `.google.`   |

use std::fmt;

use serde::Serialize;

/// Compiled matcher payload for one blacklist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    /// The domain itself; also matches any subdomain of it.
    Exact(String),
    /// Suffix including the leading dot, e.g. `.example.com`.
    PrefixWildcard(String),
    /// Prefix including the trailing dot, e.g. `google.`.
    SuffixWildcard(String),
    /// Middle including both dots, e.g. `.google.`.
    DoubleWildcard(String),
}

/// The classification of a compiled pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// `example.com` - the domain and all of its subdomains.
    Exact,
    /// `*.example.com` - subdomains only, never the apex.
    PrefixWildcard,
    /// `google.*` - the name under any TLD, plus its subdomains.
    SuffixWildcard,
    /// `*.google.*` - any subdomain of the name under any TLD.
    DoubleWildcard,
}

impl PatternKind {
    /// Returns a short human-readable name for this kind.
    pub fn name(&self) -> &'static str {
        match self {
            PatternKind::Exact => "exact",
            PatternKind::PrefixWildcard => "prefix wildcard",
            PatternKind::SuffixWildcard => "suffix wildcard",
            PatternKind::DoubleWildcard => "double wildcard",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable compiled blacklist rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    text: String,
    matcher: Matcher,
}

impl Pattern {
    /// Compiles a blacklist entry.
    ///
    /// Never fails: any string is accepted and classified. The entry is
    /// trimmed and lower-cased before it is stored. Callers skip blank
    /// entries before reaching this point.
    pub fn compile(pattern: &str) -> Self {
        let text = pattern.trim().to_lowercase();

        let has_prefix = text.starts_with("*.");
        let has_suffix = text.ends_with(".*");

        let matcher = match (has_prefix, has_suffix) {
            // "*.google.*" keeps both dots: ".google."
            (true, true) => Matcher::DoubleWildcard(text[1..text.len() - 1].to_string()),
            // "*.example.com" keeps the leading dot: ".example.com"
            (true, false) => Matcher::PrefixWildcard(text[1..].to_string()),
            // "google.*" keeps the trailing dot: "google."
            (false, true) => Matcher::SuffixWildcard(text[..text.len() - 1].to_string()),
            (false, false) => Matcher::Exact(text.clone()),
        };

        Self { text, matcher }
    }

    /// Returns the normalized source text of this pattern.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the classification of this pattern.
    pub fn kind(&self) -> PatternKind {
        match self.matcher {
            Matcher::Exact(_) => PatternKind::Exact,
            Matcher::PrefixWildcard(_) => PatternKind::PrefixWildcard,
            Matcher::SuffixWildcard(_) => PatternKind::SuffixWildcard,
            Matcher::DoubleWildcard(_) => PatternKind::DoubleWildcard,
        }
    }

    /// Tests an already-normalized (trimmed, lower-cased, port-free) domain.
    pub fn matches(&self, domain: &str) -> bool {
        match &self.matcher {
            Matcher::Exact(base) => match domain.strip_suffix(base.as_str()) {
                Some(rest) => rest.is_empty() || rest.ends_with('.'),
                None => false,
            },
            Matcher::PrefixWildcard(suffix) => {
                domain.ends_with(suffix.as_str()) && domain != &suffix[1..]
            }
            Matcher::SuffixWildcard(prefix) => {
                if let Some(rest) = domain.strip_prefix(prefix.as_str()) {
                    // Something has to follow the dot, e.g. the TLD.
                    return !rest.is_empty();
                }
                // Substring test, not label-aware: "www.google.com" and
                // "x.google.co.uk" both contain ".google.".
                domain
                    .match_indices('.')
                    .any(|(i, _)| domain[i + 1..].starts_with(prefix.as_str()))
            }
            Matcher::DoubleWildcard(middle) => domain.contains(middle.as_str()),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Normalizes a candidate host for matching.
///
/// Strips a trailing `:port` (everything after the last colon), then trims
/// and lower-cases what is left.
pub fn normalize_domain(host: &str) -> String {
    let host = match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    };
    host.trim().to_lowercase()
}
