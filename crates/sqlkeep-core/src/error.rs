//! Error types for sqlkeep-core

use sqlkeep_config::ConfigError;
use thiserror::Error;

/// The reference tree a handle belonged to has been invalidated.
///
/// Recoverable: the holder must stop using the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("statement handle has been invalidated")]
pub struct HandleInvalidated;

/// Errors raised by the database facade.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The statement or cursor was closed by another owner
    #[error(transparent)]
    HandleInvalidated(#[from] HandleInvalidated),

    /// Failure reported by SQLite, passed through unchanged
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid statement '{sql}': {message}")]
    InvalidStatement { sql: String, message: String },

    #[error("database is closed")]
    Closed,

    #[error("prepared statement is closed")]
    StatementClosed,

    #[error("statement expects {expected} parameters, {found} given")]
    ParameterCount { expected: usize, found: usize },

    #[error("unknown parameter name '{0}'")]
    UnknownParameter(String),

    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error("column index {index} out of range (result has {count} columns)")]
    ColumnOutOfRange { index: usize, count: usize },

    #[error("result set has no current row")]
    NoCurrentRow,

    #[error("column {column} holds {found}, expected {expected}")]
    ColumnType {
        column: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DatabaseError {
    pub(crate) fn invalid_statement(sql: &str, message: impl Into<String>) -> Self {
        Self::InvalidStatement {
            sql: sql.to_string(),
            message: message.into(),
        }
    }
}

/// Result alias for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;
