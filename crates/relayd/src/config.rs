//! Daemon configuration.
//!
//! Loaded from a TOML file, then overridden from the environment:
//!
//! ```toml
//! socket_path = "/tmp/relayd.sock"
//! state_dir = "/home/me/.config/relayd/data"
//! accounts = ["+15551234567"]
//!
//! [retry]
//! initial_backoff_ms = 500
//! max_backoff_ms = 30000
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use relay_core::AccountId;

use crate::receiver::{duration_millis, RetryPolicy};
use crate::server::DEFAULT_SOCKET_PATH;
use crate::spool;

/// Overrides `socket_path`.
pub const SOCKET_ENV: &str = "RELAYD_SOCKET";

/// Overrides `state_dir`.
pub const STATE_DIR_ENV: &str = "RELAYD_STATE_DIR";

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid retry settings: max_backoff_ms ({max}) is below initial_backoff_ms ({initial})")]
    Retry { initial: u64, max: u64 },
}

/// `[retry]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            initial_backoff_ms: duration_millis(policy.initial_backoff),
            max_backoff_ms: duration_millis(policy.max_backoff),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub socket_path: PathBuf,
    pub state_dir: PathBuf,
    pub accounts: Vec<AccountId>,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            state_dir: default_state_dir(),
            accounts: Vec::new(),
            retry: RetryConfig::default(),
        }
    }
}

/// `<home>/.config/relayd/data`, or a relative `relayd-data` without a home.
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".config").join("relayd").join("data"))
        .unwrap_or_else(|| PathBuf::from("relayd-data"))
}

/// `<config_dir>/relayd/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("relayd").join("config.toml"))
}

impl Config {
    /// Parses a config document.
    ///
    /// # Errors
    ///
    /// `ConfigError::Parse` on invalid TOML or unknown fields,
    /// `ConfigError::Retry` on an inverted backoff range.
    pub fn from_toml(path: &Path, text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the config at `path`, or the default location when `None`.
    ///
    /// A missing file yields defaults. Environment overrides are applied
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Any read error other than not-found, and every parse error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);

        let mut config = match path {
            Some(path) => match fs::read_to_string(&path) {
                Ok(text) => {
                    debug!(path = %path.display(), "Loaded config file");
                    Self::from_toml(&path, &text)?
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "No config file, using defaults");
                    Self::default()
                }
                Err(source) => return Err(ConfigError::Read { path, source }),
            },
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies `RELAYD_*` overrides, looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(socket) = lookup(SOCKET_ENV).filter(|v| !v.is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(state_dir) = lookup(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
            self.state_dir = PathBuf::from(state_dir);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(ConfigError::Retry {
                initial: self.retry.initial_backoff_ms,
                max: self.retry.max_backoff_ms,
            });
        }
        Ok(())
    }

    /// Configured accounts merged with those found in `state_dir`,
    /// sorted and deduplicated.
    pub fn all_accounts(&self) -> Vec<AccountId> {
        let mut accounts = self.accounts.clone();
        match spool::list_accounts(&self.state_dir) {
            Ok(found) => accounts.extend(found),
            Err(e) => warn!(
                state_dir = %self.state_dir.display(),
                error = %e,
                "Could not scan state directory for accounts"
            ),
        }
        accounts.sort();
        accounts.dedup();
        accounts
    }
}
