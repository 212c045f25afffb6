//! Configuration loading and representation.
//!
//! Read from the process environment:
//!
//! | variable | meaning | default |
//! |----------|---------|---------|
//! | `DATABASE_URL` | Postgres connection string; in-memory store when unset | unset |
//! | `SPLITBOOK_MAX_COMMIT_RETRIES` | retries after a commit conflict | `3` |
//! | `SPLITBOOK_LOG_FORMAT` | `json` or `pretty` | `json` |

use splitbook_observability::LogFormat;
use thiserror::Error;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const MAX_COMMIT_RETRIES: &str = "SPLITBOOK_MAX_COMMIT_RETRIES";
pub const LOG_FORMAT: &str = "SPLITBOOK_LOG_FORMAT";

pub(crate) const DEFAULT_MAX_COMMIT_RETRIES: u32 = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub database_url: Option<String>,
    /// How many times a conflicting commit is retried before giving up.
    pub max_commit_retries: u32,
    pub log_format: LogFormat,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
            log_format: LogFormat::default(),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database_url = lookup(DATABASE_URL).filter(|url| !url.trim().is_empty());

        if let Some(raw) = lookup(MAX_COMMIT_RETRIES) {
            config.max_commit_retries = raw.trim().parse().map_err(|e| ConfigError::Invalid {
                name: MAX_COMMIT_RETRIES,
                reason: format!("{raw:?}: {e}"),
            })?;
        }

        if let Some(raw) = lookup(LOG_FORMAT) {
            config.log_format = raw.parse().map_err(|e| ConfigError::Invalid {
                name: LOG_FORMAT,
                reason: format!("{e}"),
            })?;
        }

        Ok(config)
    }

    /// Install the process-wide tracing subscriber in the configured format.
    pub fn init_tracing(&self) {
        splitbook_observability::init_with(self.log_format);
    }
}
