//! sqlkeep Configuration Management
//!
//! Provides configuration loading with support for:
//! - Global config: `~/.sqlkeep/config.toml`
//! - Local config: `.sqlkeep/config.toml` (in a project root)
//! - Explicit config files
//! - Programmatic overrides via `ConfigOverrides`
//!
//! Configuration is merged in order: global → local → overrides.

mod error;
mod loader;

pub use error::{ConfigError, FileOp};
pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default number of idle compiled statements kept per connection.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Default busy timeout in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Log levels accepted as a bare `logging.level` value.
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Root configuration for sqlkeep.
///
/// Represents the fully merged configuration from all sources.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SqlkeepConfig {
    /// Database connection settings
    pub database: DatabaseConfig,

    /// Compiled statement cache settings
    pub statement_cache: StatementCacheConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Database connection configuration.
///
/// # Example TOML
///
/// ```toml
/// [database]
/// path = "data/app.db"
/// mode = "read-write-create"
/// busy_timeout_ms = 5000
/// foreign_keys = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file path. `None` opens a private in-memory database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// How the database file is opened
    pub mode: OpenMode,

    /// How long a statement waits on a locked database before failing
    pub busy_timeout_ms: u64,

    /// Enforce foreign key constraints
    pub foreign_keys: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            mode: OpenMode::default(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            foreign_keys: true,
        }
    }
}

impl DatabaseConfig {
    /// Whether this configuration opens an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }

    /// Resolve the database path against a project root.
    ///
    /// Absolute paths are returned unchanged.
    pub fn resolve_path(&self, root: &Path) -> Option<PathBuf> {
        self.path.as_ref().map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                root.join(path)
            }
        })
    }
}

/// How a database file is opened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OpenMode {
    /// Open for reading and writing, creating the file if needed (default)
    #[default]
    ReadWriteCreate,
    /// Open an existing file for reading and writing
    ReadWrite,
    /// Open an existing file read-only
    ReadOnly,
}

impl std::fmt::Display for OpenMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadWriteCreate => write!(f, "read-write-create"),
            Self::ReadWrite => write!(f, "read-write"),
            Self::ReadOnly => write!(f, "read-only"),
        }
    }
}

impl std::str::FromStr for OpenMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read-write-create" | "rwc" | "create" => Ok(Self::ReadWriteCreate),
            "read-write" | "rw" => Ok(Self::ReadWrite),
            "read-only" | "ro" => Ok(Self::ReadOnly),
            _ => Err(ConfigError::UnknownOpenMode(s.to_string())),
        }
    }
}

/// Compiled statement cache configuration.
///
/// # Example TOML
///
/// ```toml
/// [statement_cache]
/// enabled = true
/// capacity = 64
/// max_per_query = 4
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StatementCacheConfig {
    /// Pool compiled statements between uses
    pub enabled: bool,

    /// Maximum number of idle statements retained
    pub capacity: usize,

    /// Maximum idle statements retained for a single statement text
    /// (None = same as `capacity`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_per_query: Option<usize>,
}

impl Default for StatementCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_CACHE_CAPACITY,
            max_per_query: None,
        }
    }
}

impl StatementCacheConfig {
    /// Effective per-statement-text share of the capacity.
    pub fn effective_max_per_query(&self) -> usize {
        self.max_per_query.unwrap_or(self.capacity)
    }

    /// Validate cache settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_per_query == Some(0) {
            return Err(ConfigError::ZeroPerQueryShare);
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or an env-filter directive
    pub level: String,

    /// Log format (text, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Validate the log level.
    ///
    /// Directives such as `sqlkeep_core=debug` are passed through untouched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.level.trim();
        if level.contains('=') || level.contains(',') {
            return Ok(());
        }
        if LOG_LEVELS.contains(&level.to_lowercase().as_str()) {
            Ok(())
        } else {
            Err(ConfigError::UnknownLogLevel(self.level.clone()))
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON structured logging
    Json,
}

/// Programmatic overrides for configuration values.
///
/// Applied over file-based config, typically from command-line or
/// environment settings of the embedding application.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override the database path
    pub database_path: Option<PathBuf>,

    /// Override the open mode
    pub mode: Option<OpenMode>,

    /// Override the statement cache capacity
    pub cache_capacity: Option<usize>,

    /// Enable or disable the statement cache
    pub cache_enabled: Option<bool>,

    /// Override log level
    pub log_level: Option<String>,
}

impl SqlkeepConfig {
    /// Configuration for a private in-memory database with defaults.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Configuration for a database file with defaults.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.database.path = Some(path.into());
        config
    }

    /// Apply overrides to this configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref path) = overrides.database_path {
            self.database.path = Some(path.clone());
        }

        if let Some(mode) = overrides.mode {
            self.database.mode = mode;
        }

        if let Some(capacity) = overrides.cache_capacity {
            self.statement_cache.capacity = capacity;
        }

        if let Some(enabled) = overrides.cache_enabled {
            self.statement_cache.enabled = enabled;
        }

        if let Some(ref level) = overrides.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.statement_cache.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}
