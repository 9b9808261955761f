//! Rule engine: the blacklist decision point.
//!
//! The engine owns the active rule set as an immutable snapshot behind a
//! read/write lock. Lookups clone the snapshot handle under the read lock and
//! match without holding it; [`RuleEngine::replace_rules`] compiles a complete
//! new snapshot first and swaps it in under the write lock, so a lookup sees
//! either the old set or the new set, never a mix.
//!
//! Decision counters are plain atomics and never touch the rule-set lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::pattern::{normalize_domain, Pattern};

/// Outcome of a blacklist lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The domain matched a blacklist entry.
    Blocked {
        /// Source text of the first matching pattern.
        pattern: String,
    },
    /// No pattern matched.
    Allowed,
}

impl Decision {
    /// Returns true if the decision is [`Decision::Blocked`].
    pub fn is_blocked(&self) -> bool {
        matches!(self, Decision::Blocked { .. })
    }

    /// Returns the matched pattern for a blocked decision.
    pub fn matched_pattern(&self) -> Option<&str> {
        match self {
            Decision::Blocked { pattern } => Some(pattern),
            Decision::Allowed => None,
        }
    }
}

/// One decision as reported to a [`DecisionSink`].
#[derive(Debug, Clone, Copy)]
pub struct DecisionRecord<'a> {
    /// The normalized domain that was checked.
    pub domain: &'a str,
    /// The decision that was made.
    pub decision: &'a Decision,
}

/// Receiver for decision log records.
///
/// Called synchronously from [`RuleEngine::decide`], so it should be cheap.
pub type DecisionSink = Arc<dyn Fn(&DecisionRecord<'_>) + Send + Sync>;

/// Returns a sink that writes each decision as a `tracing` event.
pub fn tracing_sink() -> DecisionSink {
    Arc::new(log_decision)
}

fn log_decision(record: &DecisionRecord<'_>) {
    match record.decision {
        Decision::Blocked { pattern } => {
            tracing::info!(
                target: "netblock::decision",
                domain = %record.domain,
                decision = "blocked",
                pattern = %pattern,
                "[BLOCKED] {} (matched: {})",
                record.domain,
                pattern
            );
        }
        Decision::Allowed => {
            tracing::info!(
                target: "netblock::decision",
                domain = %record.domain,
                decision = "allowed",
                "[ALLOWED] {}",
                record.domain
            );
        }
    }
}

/// Snapshot of the decision counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecisionStats {
    /// Number of blocked decisions.
    pub blocked: u64,
    /// Number of allowed decisions.
    pub allowed: u64,
}

impl DecisionStats {
    /// Total number of decisions.
    pub fn total(&self) -> u64 {
        self.blocked + self.allowed
    }
}

/// Logging flags consulted on every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFlags {
    /// Report blocked decisions to the sink.
    pub log_blocked: bool,
    /// Report allowed decisions to the sink.
    pub log_allowed: bool,
}

impl Default for LogFlags {
    fn default() -> Self {
        Self {
            log_blocked: true,
            log_allowed: false,
        }
    }
}

/// Blacklist rule engine.
///
/// Cheap to share behind an [`Arc`]; every method takes `&self`.
pub struct RuleEngine {
    rules: RwLock<Arc<[Pattern]>>,
    sink: Option<DecisionSink>,
    log_blocked: AtomicBool,
    log_allowed: AtomicBool,
    blocked: AtomicU64,
    allowed: AtomicU64,
}

impl fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleEngine")
            .field("patterns", &self.pattern_count())
            .field("sink", &self.sink.is_some())
            .field("log_flags", &self.log_flags())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    /// Creates an empty engine with no logging sink.
    pub fn new() -> Self {
        Self::build(None, LogFlags::default())
    }

    /// Creates an empty engine that reports decisions to `sink`.
    pub fn with_sink(sink: DecisionSink, flags: LogFlags) -> Self {
        Self::build(Some(sink), flags)
    }

    fn build(sink: Option<DecisionSink>, flags: LogFlags) -> Self {
        Self {
            rules: RwLock::new(Arc::from(Vec::new())),
            sink,
            log_blocked: AtomicBool::new(flags.log_blocked),
            log_allowed: AtomicBool::new(flags.log_allowed),
            blocked: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
        }
    }

    /// Updates which outcomes are reported to the sink.
    pub fn set_logging(&self, flags: LogFlags) {
        self.log_blocked.store(flags.log_blocked, Ordering::Relaxed);
        self.log_allowed.store(flags.log_allowed, Ordering::Relaxed);
    }

    /// Returns the current logging flags.
    pub fn log_flags(&self) -> LogFlags {
        LogFlags {
            log_blocked: self.log_blocked.load(Ordering::Relaxed),
            log_allowed: self.log_allowed.load(Ordering::Relaxed),
        }
    }

    /// Replaces the whole rule set.
    ///
    /// Blank entries (after trimming) are skipped. Order is preserved and
    /// decides which pattern is reported when several match.
    pub fn replace_rules<I, S>(&self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compiled: Vec<Pattern> = patterns
            .into_iter()
            .filter(|p| !p.as_ref().trim().is_empty())
            .map(|p| Pattern::compile(p.as_ref()))
            .collect();
        let count = compiled.len();

        *self.rules.write() = Arc::from(compiled);

        tracing::info!(patterns = count, "Updated blacklist with {} patterns", count);
    }

    /// Checks a host against the active rule set.
    ///
    /// The host is normalized first (`:port` stripped, trimmed, lower-cased).
    /// Exactly one counter is incremented per call.
    pub fn decide(&self, host: &str) -> Decision {
        let domain = normalize_domain(host);
        let rules = self.rules.read().clone();
        let decision = first_match(&rules, &domain);

        let report = if decision.is_blocked() {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            self.log_blocked.load(Ordering::Relaxed)
        } else {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            self.log_allowed.load(Ordering::Relaxed)
        };

        if report {
            if let Some(sink) = &self.sink {
                sink(&DecisionRecord {
                    domain: &domain,
                    decision: &decision,
                });
            }
        }

        decision
    }

    /// Convenience wrapper around [`RuleEngine::decide`].
    pub fn is_blocked(&self, host: &str) -> bool {
        self.decide(host).is_blocked()
    }

    /// Returns the blocked/allowed counters.
    ///
    /// The two counters are read independently, so under concurrent traffic
    /// the pair may be off by the decisions made between the two loads.
    pub fn stats(&self) -> DecisionStats {
        DecisionStats {
            blocked: self.blocked.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
        }
    }

    /// Returns the normalized text of every active pattern, in order.
    pub fn current_patterns(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect()
    }

    /// Returns the compiled active rule set.
    pub fn snapshot(&self) -> Arc<[Pattern]> {
        self.rules.read().clone()
    }

    /// Returns the number of active patterns.
    pub fn pattern_count(&self) -> usize {
        self.rules.read().len()
    }
}

/// Evaluates an already normalized domain against `rules`, first match wins.
///
/// Pure lookup: no counters, no sink.
pub fn first_match(rules: &[Pattern], domain: &str) -> Decision {
    match rules.iter().find(|p| p.matches(domain)) {
        Some(pattern) => Decision::Blocked {
            pattern: pattern.as_str().to_string(),
        },
        None => Decision::Allowed,
    }
}
