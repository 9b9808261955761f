//! Netblock Core - blacklist patterns, rule engine, and configuration.
//!
//! This crate decides whether a destination domain is blocked:
//!
//! - [`Pattern`] compiles one blacklist entry into one of four matcher kinds
//! - [`RuleEngine`] holds the active rule set, answers allow/block queries
//!   under concurrent access, and counts decisions
//! - [`Config`] is the on-disk TOML configuration the blacklist comes from
//!
//! ## Example
//!
//! ```
//! use netblock_core::{Decision, RuleEngine};
//!
//! let engine = RuleEngine::new();
//! engine.replace_rules(["facebook.com", "google.*"]);
//!
//! assert!(engine.decide("www.facebook.com:443").is_blocked());
//! assert!(engine.decide("mail.google.de").is_blocked());
//! assert_eq!(engine.decide("example.com"), Decision::Allowed);
//! ```

pub mod config;
pub mod engine;
mod error;
pub mod pattern;

pub use config::{default_config_path, project_dirs, Config, LoggingSettings, ProxySettings};
pub use engine::{
    first_match, tracing_sink, Decision, DecisionRecord, DecisionSink, DecisionStats, LogFlags,
    RuleEngine,
};
pub use error::{ConfigError, Result};
pub use pattern::{normalize_domain, Pattern, PatternKind};
