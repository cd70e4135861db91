//! SQLite database connection
//!
//! A `Database` owns one SQLite connection and the statement cache for it.
//! Every compiled statement is obtained through the cache: checked out when
//! an idle one exists, otherwise compiled and registered so that closing the
//! database can finalize it, wherever it is.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use sqlkeep_config::{OpenMode, SqlkeepConfig};
use tracing::{debug, warn};

use super::raw::RawStatement;
use super::result_set::ResultSet;
use super::statement::{bind_all, check_parameter_count, PreparedStatement};
use crate::cache::StatementCache;
use crate::error::{DatabaseError, Result};
use crate::reference::StatementRef;

/// Connection state shared by a database and its statements
pub(crate) struct DatabaseInner {
    path: Option<PathBuf>,

    /// Pool statements between uses; otherwise each statement is one-off
    caching: bool,

    /// Declared before the connection so it is dropped first
    statements: StatementCache<RawStatement>,

    /// `None` once closed. Lock order: connection, then cache.
    conn: Mutex<Option<Connection>>,
}

impl DatabaseInner {
    /// Get a compiled statement for `sql`, from the pool or freshly compiled.
    pub(crate) fn acquire(&self, sql: &str) -> Result<StatementRef<RawStatement>> {
        if self.caching {
            if let Some(reference) = self.statements.checkout(sql) {
                return Ok(reference);
            }
        }

        // Registration happens under the connection lock so close() cannot
        // slip between compiling and tracking the statement.
        let guard = self.conn.lock();
        let conn = self.live(&guard)?;
        let raw = RawStatement::prepare(conn, sql)?;

        Ok(if self.caching {
            self.statements.register(sql, raw)
        } else {
            self.statements.register_transient(sql, raw)
        })
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> Result<T> {
        let guard = self.conn.lock();
        Ok(f(self.live(&guard)?))
    }

    /// The connection, unless it or its statement cache has been closed.
    fn live<'a>(&self, conn: &'a Option<Connection>) -> Result<&'a Connection> {
        match conn {
            Some(conn) if !self.statements.is_closed() => Ok(conn),
            _ => Err(DatabaseError::Closed),
        }
    }

    fn is_closed(&self) -> bool {
        let guard = self.conn.lock();
        self.live(&guard).is_err()
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock();
        let Some(conn) = guard.take() else {
            return Ok(());
        };

        // Finalize every statement, including those held by live
        // statements and cursors, before the connection goes away.
        self.statements.close();
        debug!(path = ?self.path, "closing database");

        conn.close().map_err(|(conn, e)| {
            *guard = Some(conn);
            DatabaseError::Sqlite(e)
        })
    }
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = ?self.path, error = %e, "failed to close database");
        }
    }
}

/// A connection to a SQLite database.
///
/// Cheap to clone; clones share the connection and statement cache.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open (creating if needed) a database file with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(&SqlkeepConfig::for_path(path.as_ref()))
    }

    /// Open a private in-memory database with default settings.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_with_config(&SqlkeepConfig::in_memory())
    }

    /// Open a database as described by `config`.
    pub fn open_with_config(config: &SqlkeepConfig) -> Result<Self> {
        config.validate()?;

        let settings = &config.database;
        let flags = open_flags(settings.mode);
        let conn = match &settings.path {
            Some(path) => Connection::open_with_flags(path, flags)?,
            None => Connection::open_in_memory_with_flags(flags)?,
        };

        conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))?;
        if settings.foreign_keys {
            conn.pragma_update(None, "foreign_keys", "ON")?;
        }

        let cache = &config.statement_cache;
        debug!(
            path = ?settings.path,
            mode = %settings.mode,
            cache_enabled = cache.enabled,
            cache_capacity = cache.capacity,
            "opened database"
        );

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                path: settings.path.clone(),
                caching: cache.enabled,
                statements: StatementCache::from_config(cache),
                conn: Mutex::new(Some(conn)),
            }),
        })
    }

    /// Database file path, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// The compiled statement cache of this connection.
    pub fn statement_cache(&self) -> &StatementCache<RawStatement> {
        &self.inner.statements
    }

    /// Compile (or reuse) a statement for repeated execution.
    pub fn prepare_statement(&self, sql: &str) -> Result<PreparedStatement> {
        let reference = self.inner.acquire(sql)?;
        PreparedStatement::new(Arc::clone(&self.inner), sql, reference)
    }

    /// Execute a statement that returns no rows.
    ///
    /// Returns the number of rows changed.
    pub fn execute_update(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut statement = self.prepare_statement(sql)?;
        statement.bind_parameters(params)?;
        statement.execute_update()
    }

    /// Execute a query and return a cursor over its rows.
    ///
    /// The cursor owns the compiled statement until it is closed or dropped.
    pub fn execute_query(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let reference = self.inner.acquire(sql)?;
        let expected = reference.perform(|stmt| stmt.parameter_count())?;
        check_parameter_count(expected, params.len())?;
        reference.perform(|stmt| bind_all(stmt, params))??;
        ResultSet::new(reference)
    }

    /// Whether a table named `name` exists.
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let mut rows = self.execute_query(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[Value::Text(name.to_string())],
        )?;
        rows.next()
    }

    /// Row id of the most recent successful insert.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        self.inner.with_connection(Connection::last_insert_rowid)
    }

    /// Rows modified by the most recently completed statement.
    pub fn changes(&self) -> Result<u64> {
        self.inner
            .with_connection(|conn| u64::try_from(conn.changes()).unwrap_or(0))
    }

    /// Whether the connection is open and answering queries.
    pub fn good_connection(&self) -> bool {
        self.inner
            .with_connection(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .is_ok()
            })
            .unwrap_or(false)
    }

    /// Whether [`close`](Self::close) has run.
    ///
    /// Closing the [statement cache](Self::statement_cache) directly also
    /// closes the database for further work; `close` still releases the
    /// connection itself.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close the connection.
    ///
    /// Every compiled statement is finalized first, including those held by
    /// open statements and cursors, which then report
    /// [`DatabaseError::HandleInvalidated`]. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .field("caching", &self.inner.caching)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn open_flags(mode: OpenMode) -> OpenFlags {
    let access = match mode {
        OpenMode::ReadWriteCreate => OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        OpenMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
        OpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
    };
    // Statements of one connection may be stepped from different threads.
    access | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_FULL_MUTEX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags_are_serialized() {
        for mode in [OpenMode::ReadWriteCreate, OpenMode::ReadWrite, OpenMode::ReadOnly] {
            let flags = open_flags(mode);
            assert!(flags.contains(OpenFlags::SQLITE_OPEN_FULL_MUTEX));
            assert!(!flags.contains(OpenFlags::SQLITE_OPEN_NO_MUTEX));
        }
        assert!(open_flags(OpenMode::ReadOnly).contains(OpenFlags::SQLITE_OPEN_READ_ONLY));
        assert!(!open_flags(OpenMode::ReadWrite).contains(OpenFlags::SQLITE_OPEN_CREATE));
    }

    #[test]
    fn test_in_memory_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.path().is_none());
        assert!(db.good_connection());

        db.execute_update("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .unwrap();
        assert!(db.table_exists("t").unwrap());
        assert!(!db.table_exists("missing").unwrap());
    }

    #[test]
    fn test_closed_database_rejects_work() {
        let db = Database::open_in_memory().unwrap();
        db.close().unwrap();

        assert!(db.is_closed());
        assert!(!db.good_connection());
        assert!(matches!(
            db.execute_update("SELECT 1", &[]),
            Err(DatabaseError::Closed)
        ));
        assert!(matches!(db.last_insert_rowid(), Err(DatabaseError::Closed)));
        db.close().unwrap();
    }

    #[test]
    fn test_closed_cache_closes_database() {
        let db = Database::open_in_memory().unwrap();
        let mut stmt = db.prepare_statement("SELECT 1").unwrap();

        db.statement_cache().close();

        assert!(db.is_closed());
        assert!(!db.good_connection());
        assert!(matches!(
            db.prepare_statement("SELECT 1"),
            Err(DatabaseError::Closed)
        ));
        assert!(matches!(stmt.execute_query(), Err(DatabaseError::Closed)));
        assert!(matches!(db.changes(), Err(DatabaseError::Closed)));

        db.close().unwrap();
        assert!(db.inner.conn.lock().is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = SqlkeepConfig::in_memory();
        config.statement_cache.max_per_query = Some(0);
        assert!(matches!(
            Database::open_with_config(&config),
            Err(DatabaseError::Config(_))
        ));
    }
}
