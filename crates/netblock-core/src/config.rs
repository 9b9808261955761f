//! Blacklist configuration file.
//!
//! The configuration is a small TOML document holding the listen address,
//! the blacklist, and the decision logging flags:
//!
//! ```toml
//! blacklist = ["facebook.com", "*.example.com", "google.*"]
//!
//! [proxy]
//! bind = "127.0.0.1"
//! port = 8080
//!
//! [logging]
//! level = "info"
//! log_blocked = true
//! log_allowed = false
//! ```

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::engine::LogFlags;
use crate::error::{ConfigError, Result};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default bind address (localhost only).
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Domains written to a freshly created configuration file.
pub const SAMPLE_BLACKLIST: &[&str] = &["facebook.com", "twitter.com", "instagram.com"];

/// Relative location of the configuration file next to the working
/// directory or the executable.
const LOCAL_CONFIG: &str = "configs/config.toml";

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Address to bind to.
    pub bind: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default log level for the binary.
    pub level: String,
    /// Log every blocked decision.
    pub log_blocked: bool,
    /// Log every allowed decision.
    pub log_allowed: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_blocked: true,
            log_allowed: false,
        }
    }
}

impl LoggingSettings {
    /// Returns the decision logging flags.
    pub fn flags(&self) -> LogFlags {
        LogFlags {
            log_blocked: self.log_blocked,
            log_allowed: self.log_allowed,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Blacklist patterns in priority order.
    pub blacklist: Vec<String>,
    /// Listener settings.
    pub proxy: ProxySettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl Config {
    /// Returns the configuration written on first run.
    pub fn sample() -> Self {
        Self {
            blacklist: SAMPLE_BLACKLIST.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes configuration to TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Writes configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, self.to_toml()?).map_err(write_err)
    }

    /// Writes the sample configuration if `path` does not exist yet.
    ///
    /// Returns true if a file was created.
    pub fn ensure_exists<P: AsRef<Path>>(path: P) -> Result<bool> {
        let path = path.as_ref();
        if path.exists() {
            return Ok(false);
        }
        Self::sample().save(path)?;
        tracing::info!(path = %path.display(), "Created default config");
        Ok(true)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.proxy.port == 0 {
            return Err(ConfigError::InvalidPort(self.proxy.port));
        }
        Ok(())
    }

    /// Appends a pattern to the blacklist.
    pub fn add_pattern(&mut self, pattern: &str) -> Result<()> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(ConfigError::EmptyPattern);
        }
        if self.blacklist.iter().any(|p| p.trim() == pattern) {
            return Err(ConfigError::DuplicatePattern(pattern.to_string()));
        }
        self.blacklist.push(pattern.to_string());
        Ok(())
    }

    /// Removes a pattern from the blacklist.
    pub fn remove_pattern(&mut self, pattern: &str) -> Result<()> {
        let pattern = pattern.trim();
        let before = self.blacklist.len();
        self.blacklist.retain(|p| p.trim() != pattern);
        if self.blacklist.len() == before {
            return Err(ConfigError::PatternNotFound(pattern.to_string()));
        }
        Ok(())
    }

    /// Returns the listen address as `bind:port`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.proxy.bind, self.proxy.port)
    }
}

/// Returns the platform project directories.
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "netblock", "Netblock")
}

/// Resolves the configuration file location.
///
/// Checks, in order: `./configs/config.toml`, `configs/config.toml` next to
/// the executable, and `config.toml` in the platform config directory.
/// Falls back to `./configs/config.toml`.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(LOCAL_CONFIG);
    if local.exists() {
        return local;
    }

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let candidate = exe_dir.join(LOCAL_CONFIG);
        if candidate.exists() {
            return candidate;
        }
    }

    if let Some(dirs) = project_dirs() {
        let candidate = dirs.config_dir().join("config.toml");
        if candidate.exists() {
            return candidate;
        }
    }

    local
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = Config::from_toml(r#"blacklist = ["a.com"]"#).unwrap();
        assert_eq!(config.blacklist, vec!["a.com"]);
        assert_eq!(config.proxy.port, DEFAULT_PORT);
        assert_eq!(config.proxy.bind, DEFAULT_BIND);
        assert!(config.logging.log_blocked);
        assert!(!config.logging.log_allowed);
    }

    #[test]
    fn parses_full_document() {
        let config = Config::from_toml(
            r#"
            blacklist = ["facebook.com", "google.*"]

            [proxy]
            bind = "0.0.0.0"
            port = 3128

            [logging]
            level = "debug"
            log_blocked = false
            log_allowed = true
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr(), "0.0.0.0:3128");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.logging.flags(),
            LogFlags {
                log_blocked: false,
                log_allowed: true
            }
        );
    }

    #[test]
    fn rejects_zero_port() {
        let err = Config::from_toml("[proxy]\nport = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(0)));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            Config::from_toml("blacklist = [").unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::sample();
        config.proxy.port = 9999;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_missing_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn ensure_exists_creates_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        assert!(Config::ensure_exists(&path).unwrap());
        assert_eq!(Config::load(&path).unwrap(), Config::sample());

        let mut edited = Config::sample();
        edited.blacklist.clear();
        edited.save(&path).unwrap();

        assert!(!Config::ensure_exists(&path).unwrap());
        assert!(Config::load(&path).unwrap().blacklist.is_empty());
    }

    #[test]
    fn add_pattern_rejects_duplicates_and_blanks() {
        let mut config = Config::default();
        config.add_pattern(" example.com ").unwrap();
        assert_eq!(config.blacklist, vec!["example.com"]);

        assert!(matches!(
            config.add_pattern("example.com"),
            Err(ConfigError::DuplicatePattern(_))
        ));
        assert!(matches!(
            config.add_pattern("   "),
            Err(ConfigError::EmptyPattern)
        ));
    }

    #[test]
    fn remove_pattern() {
        let mut config = Config::sample();
        config.remove_pattern("twitter.com").unwrap();
        assert_eq!(config.blacklist, vec!["facebook.com", "instagram.com"]);

        assert!(matches!(
            config.remove_pattern("twitter.com"),
            Err(ConfigError::PatternNotFound(_))
        ));
    }
}
