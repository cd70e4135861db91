//! Configuration error types.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// File operation that failed while loading or saving configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Read,
    Write,
    CreateDir,
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::CreateDir => "create directory",
        })
    }
}

/// Errors raised while loading, saving or validating sqlkeep settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A config file or directory could not be accessed
    #[error("cannot {op} '{path}': {source}")]
    Io {
        op: FileOp,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("cannot encode config: {0}")]
    Encode(#[from] toml::ser::Error),

    /// The global config location depends on a home directory
    #[error("no home directory for the global config")]
    NoHomeDir,

    #[error("unknown open mode '{0}' (expected read-write-create, read-write or read-only)")]
    UnknownOpenMode(String),

    /// `statement_cache.max_per_query` of zero would pool nothing while
    /// still reporting the cache as enabled
    #[error("statement_cache.max_per_query must be at least 1; set enabled = false to disable caching")]
    ZeroPerQueryShare,

    #[error("unknown log level '{0}'")]
    UnknownLogLevel(String),

    /// A global tracing subscriber could not be installed
    #[error("cannot install log subscriber: {0}")]
    Subscriber(String),
}

impl ConfigError {
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::io(FileOp::Read, path, source)
    }

    pub fn write_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::io(FileOp::Write, path, source)
    }

    pub fn create_dir(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::io(FileOp::CreateDir, path, source)
    }

    pub fn parse_toml(path: impl Into<PathBuf>, source: toml::de::Error) -> Self {
        Self::Parse {
            path: path.into(),
            source,
        }
    }

    fn io(op: FileOp, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Whether the error comes from the file system rather than the contents.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::NoHomeDir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_names_operation_and_path() {
        let source = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ConfigError::create_dir("/srv/app/.sqlkeep", source);

        assert!(err.is_io());
        assert_eq!(
            err.to_string(),
            "cannot create directory '/srv/app/.sqlkeep': denied"
        );
    }

    #[test]
    fn test_validation_messages() {
        assert_eq!(
            ConfigError::UnknownOpenMode("append".to_string()).to_string(),
            "unknown open mode 'append' (expected read-write-create, read-write or read-only)"
        );
        assert!(ConfigError::ZeroPerQueryShare
            .to_string()
            .contains("enabled = false"));
        assert!(!ConfigError::UnknownLogLevel("chatty".to_string()).is_io());
    }
}
