//! Blacklist hot reload.
//!
//! Watches the configuration file's modification time and pushes a new
//! blacklist into the [`RuleEngine`] whenever the file changes. Requests in
//! flight keep the rule set they started with; later requests see the new one.
//!
//! A file that fails to parse leaves the active rules untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use netblock_core::{Config, RuleEngine};

use crate::error::Result;

/// Default interval between modification checks.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(2);

/// Polls a configuration file and reloads the blacklist on change.
pub struct BlacklistReloader {
    path: PathBuf,
    engine: Arc<RuleEngine>,
    last_modified: Mutex<Option<SystemTime>>,
    interval: Duration,
}

impl std::fmt::Debug for BlacklistReloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlacklistReloader")
            .field("path", &self.path)
            .field("last_modified", &*self.last_modified.lock())
            .field("interval", &self.interval)
            .finish()
    }
}

impl BlacklistReloader {
    /// Creates a reloader for `path`.
    ///
    /// The file's current state counts as already loaded.
    pub fn new(path: impl Into<PathBuf>, engine: Arc<RuleEngine>) -> Self {
        let path = path.into();
        let last_modified = modified_time(&path);

        Self {
            path,
            engine,
            last_modified: Mutex::new(last_modified),
            interval: DEFAULT_RELOAD_INTERVAL,
        }
    }

    /// Sets the poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Returns the watched path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reloads the blacklist if the file changed since the last check.
    ///
    /// Returns true if new rules were installed.
    pub fn poll(&self) -> bool {
        let current = modified_time(&self.path);
        {
            let mut last = self.last_modified.lock();
            if current.is_none() || *last == current {
                return false;
            }
            *last = current;
        }

        match self.reload() {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to reload blacklist, keeping current rules"
                );
                false
            }
        }
    }

    /// Reads the file and installs its blacklist and logging flags.
    ///
    /// Returns the number of active patterns.
    pub fn reload(&self) -> Result<usize> {
        let config = Config::load(&self.path)?;
        self.engine.replace_rules(&config.blacklist);
        self.engine.set_logging(config.logging.flags());
        Ok(self.engine.pattern_count())
    }

    /// Polls until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::debug!(
            path = %self.path.display(),
            interval = ?self.interval,
            "Watching config for blacklist changes"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.poll() {
                        tracing::info!(path = %self.path.display(), "Reloaded blacklist");
                    }
                }
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
