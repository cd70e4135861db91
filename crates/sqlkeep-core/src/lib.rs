//! sqlkeep Core - compiled statement caching for SQLite
//!
//! This crate provides:
//! - A bounded pool of compiled statements keyed by statement text
//! - Reference trees that let a statement and its cursors share one
//!   compiled handle, with invalidation of any node reaching all of them
//! - A SQLite connection facade (prepared statements, result cursors) built
//!   on the two
//!
//! The cache and reference trees are generic over [`CompiledQuery`], so they
//! can pool handles of any engine.

pub mod cache;
pub mod error;
pub mod logging;
pub mod query;
pub mod reference;
pub mod sqlite;

// Re-exports for convenience
pub use cache::{CacheMetrics, StatementCache};
pub use error::{DatabaseError, HandleInvalidated, Result};
pub use logging::init_logging;
pub use query::{CompiledQuery, StatementId};
pub use reference::{NodeId, StatementRef};
pub use sqlite::{
    ColumnIndex, Database, PreparedStatement, RawStatement, ResultSet, Step,
};

// Engine value type used for bound parameters and column values
pub use rusqlite::types::Value;

// Configuration re-exports
pub use sqlkeep_config::{
    ConfigError, ConfigLoader, ConfigOverrides, DatabaseConfig, LogFormat, LoggingConfig,
    OpenMode, SqlkeepConfig, StatementCacheConfig,
};
