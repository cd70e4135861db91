//! Owned SQLite compiled statements
//!
//! `RawStatement` owns one `sqlite3_stmt` prepared against a rusqlite
//! connection and finalizes it on drop. Every method assumes exclusive
//! access, which the reference tree lock provides; connections are opened
//! in serialized mode so statements of one connection may be stepped from
//! different threads.

use std::ffi::{c_char, c_int, CStr, CString};
use std::ptr::{self, NonNull};

use rusqlite::ffi;
use rusqlite::types::Value;
use rusqlite::Connection;

use crate::error::{DatabaseError, Result};
use crate::query::CompiledQuery;

/// Outcome of one `sqlite3_step`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A row is available
    Row,
    /// The statement ran to completion
    Done,
}

/// An owned, prepared `sqlite3_stmt`.
#[derive(Debug)]
pub struct RawStatement {
    stmt: NonNull<ffi::sqlite3_stmt>,
    db: *mut ffi::sqlite3,
}

// SAFETY: the statement belongs to a connection opened with
// SQLITE_OPEN_FULL_MUTEX, and callers never use one statement from two
// threads at once.
unsafe impl Send for RawStatement {}

impl RawStatement {
    /// Compile `sql` against `conn`.
    ///
    /// Exactly one statement is accepted; empty text and trailing
    /// statements are rejected, trailing comments are not. `conn` must have
    /// been opened with `SQLITE_OPEN_FULL_MUTEX`, since the statement may be
    /// stepped on another thread than the connection is used on.
    pub fn prepare(conn: &Connection, sql: &str) -> Result<Self> {
        let len = c_int::try_from(sql.len())
            .map_err(|_| DatabaseError::invalid_statement(sql, "statement text too long"))?;

        // SAFETY: the handle stays valid for the lifetime of `conn`, which
        // outlives every statement through the database close ordering.
        let db = unsafe { conn.handle() };
        if unsafe { ffi::sqlite3_db_mutex(db) }.is_null() {
            return Err(DatabaseError::invalid_statement(
                sql,
                "connection is not in serialized threading mode",
            ));
        }

        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();

        let rc = unsafe {
            ffi::sqlite3_prepare_v2(db, sql.as_ptr().cast(), len, &mut stmt, &mut tail)
        };
        if rc != ffi::SQLITE_OK {
            return Err(error_from_db(db, rc).into());
        }

        let Some(stmt) = NonNull::new(stmt) else {
            return Err(DatabaseError::invalid_statement(sql, "empty statement"));
        };
        let statement = Self { stmt, db };

        let rest = sql.get(tail_offset(sql, tail)..).unwrap_or("");
        if has_statement(db, rest) {
            return Err(DatabaseError::invalid_statement(
                sql,
                "multiple statements are not supported",
            ));
        }

        Ok(statement)
    }

    /// Number of parameters the statement takes.
    pub fn parameter_count(&self) -> usize {
        let count = unsafe { ffi::sqlite3_bind_parameter_count(self.stmt.as_ptr()) };
        usize::try_from(count).unwrap_or(0)
    }

    /// Position (1-based) of a named parameter, including its prefix
    /// (`:name`, `@name`, `$name`).
    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        let name = CString::new(name).ok()?;
        let index =
            unsafe { ffi::sqlite3_bind_parameter_index(self.stmt.as_ptr(), name.as_ptr()) };
        usize::try_from(index).ok().filter(|&index| index > 0)
    }

    /// Bind `value` to the 1-based parameter `index`.
    pub fn bind(&mut self, index: usize, value: &Value) -> rusqlite::Result<()> {
        let stmt = self.stmt.as_ptr();
        let index = c_int::try_from(index).map_err(|_| sqlite_error(ffi::SQLITE_RANGE, None))?;

        let rc = unsafe {
            match value {
                Value::Null => ffi::sqlite3_bind_null(stmt, index),
                Value::Integer(i) => ffi::sqlite3_bind_int64(stmt, index, *i),
                Value::Real(r) => ffi::sqlite3_bind_double(stmt, index, *r),
                Value::Text(text) => {
                    let len = c_int::try_from(text.len())
                        .map_err(|_| sqlite_error(ffi::SQLITE_TOOBIG, None))?;
                    ffi::sqlite3_bind_text(
                        stmt,
                        index,
                        text.as_ptr().cast(),
                        len,
                        ffi::SQLITE_TRANSIENT(),
                    )
                }
                Value::Blob(blob) => {
                    let len = c_int::try_from(blob.len())
                        .map_err(|_| sqlite_error(ffi::SQLITE_TOOBIG, None))?;
                    ffi::sqlite3_bind_blob(
                        stmt,
                        index,
                        blob.as_ptr().cast(),
                        len,
                        ffi::SQLITE_TRANSIENT(),
                    )
                }
            }
        };
        self.check(rc)
    }

    /// Advance the statement by one step.
    pub fn step(&mut self) -> rusqlite::Result<Step> {
        match unsafe { ffi::sqlite3_step(self.stmt.as_ptr()) } {
            ffi::SQLITE_ROW => Ok(Step::Row),
            ffi::SQLITE_DONE => Ok(Step::Done),
            rc => Err(error_from_db(self.db, rc)),
        }
    }

    /// Step to completion and return the rows it changed.
    ///
    /// The connection mutex is held throughout, so the count cannot pick up
    /// a statement completed concurrently on another thread. Rows produced
    /// along the way are discarded.
    pub fn execute(&mut self) -> rusqlite::Result<u64> {
        let _guard = ConnectionLock::acquire(self.db);
        loop {
            match self.step()? {
                Step::Row => continue,
                Step::Done => return Ok(self.changes()),
            }
        }
    }

    /// Rewind the statement, keeping bindings.
    pub fn rewind(&mut self) {
        // The return code repeats the error of the last step, already reported.
        unsafe { ffi::sqlite3_reset(self.stmt.as_ptr()) };
    }

    /// Number of columns in the result.
    pub fn column_count(&self) -> usize {
        let count = unsafe { ffi::sqlite3_column_count(self.stmt.as_ptr()) };
        usize::try_from(count).unwrap_or(0)
    }

    /// Name of a result column.
    pub fn column_name(&self, index: usize) -> Option<String> {
        let index = c_int::try_from(index).ok()?;
        let name = unsafe { ffi::sqlite3_column_name(self.stmt.as_ptr(), index) };
        if name.is_null() {
            return None;
        }
        // SAFETY: SQLite returns a NUL-terminated string valid until the next
        // call on this statement; it is copied immediately.
        Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    /// Value of a column in the current row.
    pub fn column_value(&self, index: usize) -> Value {
        let stmt = self.stmt.as_ptr();
        let Ok(index) = c_int::try_from(index) else {
            return Value::Null;
        };

        unsafe {
            match ffi::sqlite3_column_type(stmt, index) {
                ffi::SQLITE_INTEGER => Value::Integer(ffi::sqlite3_column_int64(stmt, index)),
                ffi::SQLITE_FLOAT => Value::Real(ffi::sqlite3_column_double(stmt, index)),
                ffi::SQLITE_TEXT => {
                    let text = ffi::sqlite3_column_text(stmt, index);
                    let bytes = column_bytes(stmt, index, text.cast());
                    Value::Text(String::from_utf8_lossy(bytes).into_owned())
                }
                ffi::SQLITE_BLOB => {
                    let blob = ffi::sqlite3_column_blob(stmt, index);
                    Value::Blob(column_bytes(stmt, index, blob.cast()).to_vec())
                }
                _ => Value::Null,
            }
        }
    }

    /// Rows modified by the most recently completed statement on this
    /// connection, whichever thread ran it. See [`execute`](Self::execute).
    pub fn changes(&self) -> u64 {
        let changes = unsafe { ffi::sqlite3_changes(self.db) };
        u64::try_from(changes).unwrap_or(0)
    }

    fn check(&self, rc: c_int) -> rusqlite::Result<()> {
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(error_from_db(self.db, rc))
        }
    }
}

impl CompiledQuery for RawStatement {
    fn reset(&mut self) {
        unsafe {
            ffi::sqlite3_reset(self.stmt.as_ptr());
            ffi::sqlite3_clear_bindings(self.stmt.as_ptr());
        }
    }
}

impl Drop for RawStatement {
    fn drop(&mut self) {
        unsafe { ffi::sqlite3_finalize(self.stmt.as_ptr()) };
    }
}

/// Holds the recursive connection mutex of a serialized-mode connection.
struct ConnectionLock(*mut ffi::sqlite3_mutex);

impl ConnectionLock {
    fn acquire(db: *mut ffi::sqlite3) -> Self {
        // SAFETY: `db` is open; serialized mode gives it a recursive mutex,
        // which SQLite calls made while holding it re-enter.
        let mutex = unsafe { ffi::sqlite3_db_mutex(db) };
        unsafe { ffi::sqlite3_mutex_enter(mutex) };
        Self(mutex)
    }
}

impl Drop for ConnectionLock {
    fn drop(&mut self) {
        unsafe { ffi::sqlite3_mutex_leave(self.0) };
    }
}

/// Byte offset of `tail` (as returned by `sqlite3_prepare_v2`) within `sql`.
fn tail_offset(sql: &str, tail: *const c_char) -> usize {
    if tail.is_null() {
        return sql.len();
    }
    // SAFETY: `tail` points into `sql`, at or before its end.
    let consumed = unsafe { tail.offset_from(sql.as_ptr().cast()) };
    usize::try_from(consumed).map_or(sql.len(), |consumed| consumed.min(sql.len()))
}

/// Whether `sql` holds anything besides separators and comments.
fn has_statement(db: *mut ffi::sqlite3, sql: &str) -> bool {
    let mut rest = sql;
    while !rest.trim().is_empty() {
        let Ok(len) = c_int::try_from(rest.len()) else {
            return true;
        };
        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(db, rest.as_ptr().cast(), len, &mut stmt, &mut tail)
        };
        if !stmt.is_null() {
            unsafe { ffi::sqlite3_finalize(stmt) };
            return true;
        }
        if rc != ffi::SQLITE_OK {
            return true;
        }

        let consumed = tail_offset(rest, tail);
        if consumed == 0 {
            return false;
        }
        rest = rest.get(consumed..).unwrap_or("");
    }
    false
}

/// Borrow the bytes of a text or blob column.
///
/// # Safety
///
/// `data` must be the pointer SQLite just returned for this column.
unsafe fn column_bytes<'a>(stmt: *mut ffi::sqlite3_stmt, index: c_int, data: *const u8) -> &'a [u8] {
    let len = usize::try_from(ffi::sqlite3_column_bytes(stmt, index)).unwrap_or(0);
    if data.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(data, len)
    }
}

fn sqlite_error(code: c_int, message: Option<String>) -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(ffi::Error::new(code), message)
}

fn error_from_db(db: *mut ffi::sqlite3, code: c_int) -> rusqlite::Error {
    let message = unsafe {
        let message = ffi::sqlite3_errmsg(db);
        (!message.is_null()).then(|| CStr::from_ptr(message).to_string_lossy().into_owned())
    };
    sqlite_error(code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rusqlite::OpenFlags;

    fn connection() -> Connection {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let conn = Connection::open_in_memory_with_flags(flags).unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, data BLOB, score REAL)")
            .unwrap();
        conn
    }

    #[test]
    fn test_prepare_and_step() {
        let conn = connection();
        let mut stmt = RawStatement::prepare(&conn, "SELECT 1, 'a'").unwrap();

        assert_eq!(stmt.column_count(), 2);
        assert_eq!(stmt.step().unwrap(), Step::Row);
        assert_eq!(stmt.column_value(0), Value::Integer(1));
        assert_eq!(stmt.column_value(1), Value::Text("a".to_string()));
        assert_eq!(stmt.step().unwrap(), Step::Done);
    }

    #[test]
    fn test_prepare_rejects_bad_sql() {
        let conn = connection();
        let err = RawStatement::prepare(&conn, "SELEC 1").unwrap_err();
        assert!(matches!(err, DatabaseError::Sqlite(_)));
    }

    #[test]
    fn test_prepare_rejects_empty_sql() {
        let conn = connection();
        let err = RawStatement::prepare(&conn, "  ").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidStatement { .. }));
    }

    #[test]
    fn test_prepare_rejects_trailing_statement() {
        let conn = connection();
        let err = RawStatement::prepare(&conn, "SELECT 1; SELECT 2").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidStatement { .. }));

        assert!(RawStatement::prepare(&conn, "SELECT 1; ").is_ok());
    }

    #[test]
    fn test_prepare_accepts_trailing_comments() {
        let conn = connection();
        for sql in [
            "SELECT 1; -- trailing comment",
            "SELECT 1 /* block */",
            "SELECT 1;\n-- one\n/* two */ ;",
        ] {
            assert!(RawStatement::prepare(&conn, sql).is_ok(), "{sql}");
        }

        let err = RawStatement::prepare(&conn, "SELECT 1; -- note\nSELECT 2").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidStatement { .. }));
    }

    #[test]
    fn test_prepare_requires_serialized_connection() {
        // rusqlite's default flags open the connection without a mutex
        let conn = Connection::open_in_memory().unwrap();
        let err = RawStatement::prepare(&conn, "SELECT 1").unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::InvalidStatement { ref message, .. } if message.contains("serialized")
        ));
    }

    #[test]
    fn test_execute_counts_own_changes() {
        let conn = connection();
        conn.execute_batch("INSERT INTO t (id) VALUES (1), (2), (3)")
            .unwrap();

        let mut update = RawStatement::prepare(&conn, "UPDATE t SET name = 'x' WHERE id < 3").unwrap();
        assert_eq!(update.execute().unwrap(), 2);

        // Rows of a query are stepped through and discarded
        let mut select = RawStatement::prepare(&conn, "SELECT id FROM t").unwrap();
        assert!(select.execute().is_ok());
        assert_eq!(select.step().unwrap(), Step::Done);
    }

    #[test]
    fn test_bind_roundtrip_all_storage_classes() {
        let conn = connection();
        let mut insert =
            RawStatement::prepare(&conn, "INSERT INTO t (id, name, data, score) VALUES (?, ?, ?, ?)")
                .unwrap();
        assert_eq!(insert.parameter_count(), 4);

        insert.bind(1, &Value::Integer(7)).unwrap();
        insert.bind(2, &Value::Text("seven".to_string())).unwrap();
        insert.bind(3, &Value::Blob(vec![0, 1, 2])).unwrap();
        insert.bind(4, &Value::Null).unwrap();
        assert_eq!(insert.step().unwrap(), Step::Done);
        assert_eq!(insert.changes(), 1);

        let mut select = RawStatement::prepare(&conn, "SELECT id, name, data, score FROM t").unwrap();
        assert_eq!(select.step().unwrap(), Step::Row);
        assert_eq!(select.column_value(0), Value::Integer(7));
        assert_eq!(select.column_value(1), Value::Text("seven".to_string()));
        assert_eq!(select.column_value(2), Value::Blob(vec![0, 1, 2]));
        assert_eq!(select.column_value(3), Value::Null);
        assert_eq!(select.column_name(1).as_deref(), Some("name"));
    }

    #[test]
    fn test_named_parameters() {
        let conn = connection();
        let stmt = RawStatement::prepare(&conn, "SELECT :a, @b, $c").unwrap();
        assert_eq!(stmt.parameter_index(":a"), Some(1));
        assert_eq!(stmt.parameter_index("@b"), Some(2));
        assert_eq!(stmt.parameter_index("$c"), Some(3));
        assert_eq!(stmt.parameter_index(":missing"), None);
    }

    #[test]
    fn test_bind_out_of_range() {
        let conn = connection();
        let mut stmt = RawStatement::prepare(&conn, "SELECT ?").unwrap();
        assert!(stmt.bind(2, &Value::Integer(1)).is_err());
    }

    #[test]
    fn test_reset_clears_bindings() {
        let conn = connection();
        let mut stmt = RawStatement::prepare(&conn, "SELECT ?").unwrap();
        stmt.bind(1, &Value::Integer(5)).unwrap();
        assert_eq!(stmt.step().unwrap(), Step::Row);
        assert_eq!(stmt.column_value(0), Value::Integer(5));

        CompiledQuery::reset(&mut stmt);
        assert_eq!(stmt.step().unwrap(), Step::Row);
        assert_eq!(stmt.column_value(0), Value::Null);
    }

    #[test]
    fn test_rewind_keeps_bindings() {
        let conn = connection();
        let mut stmt = RawStatement::prepare(&conn, "SELECT ?").unwrap();
        stmt.bind(1, &Value::Integer(5)).unwrap();
        stmt.step().unwrap();

        stmt.rewind();
        assert_eq!(stmt.step().unwrap(), Step::Row);
        assert_eq!(stmt.column_value(0), Value::Integer(5));
    }

    #[test]
    fn test_step_reports_constraint_error() {
        let conn = connection();
        conn.execute("INSERT INTO t (id) VALUES (1)", []).unwrap();
        let mut stmt = RawStatement::prepare(&conn, "INSERT INTO t (id) VALUES (1)").unwrap();

        let err = stmt.step().unwrap_err();
        assert!(matches!(err, rusqlite::Error::SqliteFailure(_, Some(_))));
    }
}
