//! Configuration loader with inheritance support.
//!
//! Loads configuration from multiple sources and merges them:
//! 1. Global config: `~/.sqlkeep/config.toml`
//! 2. Local config: `.sqlkeep/config.toml` (in a project root)
//! 3. Overrides
//!
//! Later sources override earlier ones.

use crate::error::ConfigError;
use crate::{
    ConfigOverrides, DatabaseConfig, LoggingConfig, SqlkeepConfig, StatementCacheConfig,
    DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_CACHE_CAPACITY,
};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Global configuration directory name.
const GLOBAL_CONFIG_DIR: &str = ".sqlkeep";

/// Local configuration directory name.
const LOCAL_CONFIG_DIR: &str = ".sqlkeep";

/// Configuration loader with caching and inheritance support.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Global config directory (e.g., `~/.sqlkeep`)
    global_config_dir: Option<PathBuf>,

    /// Cached global config
    global_config: Option<SqlkeepConfig>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new configuration loader.
    ///
    /// Automatically detects the global config directory (`~/.sqlkeep`).
    pub fn new() -> Self {
        let global_config_dir = dirs::home_dir().map(|h| h.join(GLOBAL_CONFIG_DIR));

        Self {
            global_config_dir,
            global_config: None,
        }
    }

    /// Create a loader with a custom global config directory.
    ///
    /// Useful for testing.
    pub fn with_global_dir(global_dir: impl Into<PathBuf>) -> Self {
        Self {
            global_config_dir: Some(global_dir.into()),
            global_config: None,
        }
    }

    /// Get the global config file path.
    pub fn global_config_path(&self) -> Option<PathBuf> {
        self.global_config_dir
            .as_ref()
            .map(|d| d.join(CONFIG_FILE_NAME))
    }

    /// Get the local config file path for a project root.
    pub fn local_config_path(&self, root: &Path) -> PathBuf {
        root.join(LOCAL_CONFIG_DIR).join(CONFIG_FILE_NAME)
    }

    /// Load configuration for a project root with optional overrides.
    ///
    /// Merges config in order: global → local → overrides, then validates.
    pub fn load(
        &mut self,
        root: &Path,
        overrides: Option<&ConfigOverrides>,
    ) -> Result<SqlkeepConfig, ConfigError> {
        let mut config = SqlkeepConfig::default();

        if let Some(global_config) = self.load_global()? {
            config = merge_configs(config, global_config);
        }

        if let Some(local_config) = self.load_local(root)? {
            config = merge_configs(config, local_config);
        }

        if let Some(ovr) = overrides {
            config.apply_overrides(ovr);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a single explicit configuration file, without inheritance.
    pub fn load_file(&self, path: &Path) -> Result<SqlkeepConfig, ConfigError> {
        debug!("Loading config from {:?}", path);
        let config = load_config_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load only the global configuration.
    pub fn load_global(&mut self) -> Result<Option<SqlkeepConfig>, ConfigError> {
        if let Some(ref config) = self.global_config {
            return Ok(Some(config.clone()));
        }

        let Some(global_path) = self.global_config_path() else {
            debug!("No home directory found, skipping global config");
            return Ok(None);
        };

        if !global_path.exists() {
            trace!("Global config not found at {:?}", global_path);
            return Ok(None);
        }

        debug!("Loading global config from {:?}", global_path);
        let config = load_config_file(&global_path)?;

        self.global_config = Some(config.clone());

        Ok(Some(config))
    }

    /// Load only the local configuration for a project root.
    pub fn load_local(&self, root: &Path) -> Result<Option<SqlkeepConfig>, ConfigError> {
        let local_path = self.local_config_path(root);

        if !local_path.exists() {
            trace!("Local config not found at {:?}", local_path);
            return Ok(None);
        }

        debug!("Loading local config from {:?}", local_path);
        load_config_file(&local_path).map(Some)
    }

    /// Save configuration to the global config file.
    pub fn save_global(&self, config: &SqlkeepConfig) -> Result<(), ConfigError> {
        let Some(ref global_dir) = self.global_config_dir else {
            return Err(ConfigError::NoHomeDir);
        };

        save_config_file(&global_dir.join(CONFIG_FILE_NAME), config)
    }

    /// Save configuration to the local config file for a project root.
    pub fn save_local(&self, root: &Path, config: &SqlkeepConfig) -> Result<(), ConfigError> {
        save_config_file(&self.local_config_path(root), config)
    }

    /// Initialize global configuration.
    ///
    /// Creates `~/.sqlkeep/config.toml` with default configuration if absent.
    pub fn init_global(&self) -> Result<PathBuf, ConfigError> {
        let Some(ref global_dir) = self.global_config_dir else {
            return Err(ConfigError::NoHomeDir);
        };

        init_config_dir(global_dir)
    }

    /// Initialize local configuration for a project root.
    ///
    /// Creates `.sqlkeep/config.toml` with default configuration if absent.
    pub fn init_local(&self, root: &Path) -> Result<PathBuf, ConfigError> {
        init_config_dir(&root.join(LOCAL_CONFIG_DIR))
    }

    /// Clear cached global configuration.
    ///
    /// Forces reload on next `load_global()` call.
    pub fn clear_cache(&mut self) {
        self.global_config = None;
    }
}

/// Create a config directory holding a default config file.
fn init_config_dir(dir: &Path) -> Result<PathBuf, ConfigError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::create_dir(dir, e))?;
    }

    let config_path = dir.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        save_config_file(&config_path, &SqlkeepConfig::default())?;
    }

    Ok(config_path)
}

/// Load a configuration file from disk.
fn load_config_file(path: &Path) -> Result<SqlkeepConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;

    toml::from_str(&content).map_err(|e| ConfigError::parse_toml(path, e))
}

/// Save a configuration file to disk.
fn save_config_file(path: &Path, config: &SqlkeepConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))
}

/// Merge two configurations, with `overlay` taking precedence.
///
/// Values left at their defaults in `overlay` keep the base value.
fn merge_configs(base: SqlkeepConfig, overlay: SqlkeepConfig) -> SqlkeepConfig {
    SqlkeepConfig {
        database: merge_database(base.database, overlay.database),
        statement_cache: merge_statement_cache(base.statement_cache, overlay.statement_cache),
        logging: merge_logging(base.logging, overlay.logging),
    }
}

/// Merge database config.
fn merge_database(base: DatabaseConfig, overlay: DatabaseConfig) -> DatabaseConfig {
    DatabaseConfig {
        path: overlay.path.or(base.path),
        mode: if overlay.mode != crate::OpenMode::default() {
            overlay.mode
        } else {
            base.mode
        },
        busy_timeout_ms: if overlay.busy_timeout_ms != DEFAULT_BUSY_TIMEOUT_MS {
            overlay.busy_timeout_ms
        } else {
            base.busy_timeout_ms
        },
        foreign_keys: overlay.foreign_keys && base.foreign_keys,
    }
}

/// Merge statement cache config.
fn merge_statement_cache(
    base: StatementCacheConfig,
    overlay: StatementCacheConfig,
) -> StatementCacheConfig {
    StatementCacheConfig {
        enabled: overlay.enabled && base.enabled,
        capacity: if overlay.capacity != DEFAULT_CACHE_CAPACITY {
            overlay.capacity
        } else {
            base.capacity
        },
        max_per_query: overlay.max_per_query.or(base.max_per_query),
    }
}

/// Merge logging config.
fn merge_logging(base: LoggingConfig, overlay: LoggingConfig) -> LoggingConfig {
    LoggingConfig {
        level: if overlay.level != "info" {
            overlay.level
        } else {
            base.level
        },
        format: overlay.format,
    }
}
