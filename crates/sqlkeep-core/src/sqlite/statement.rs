//! Prepared statements
//!
//! A `PreparedStatement` owns the root of a reference tree. Cursors created
//! by [`PreparedStatement::execute_query`] hold clones of it, so closing
//! either side invalidates the other. The statement keeps its text and bound
//! values on the Rust side, which lets it transparently acquire a new handle
//! from the cache when its previous tree was invalidated by a cursor.

use std::ops::ControlFlow;
use std::sync::Arc;

use rusqlite::types::Value;

use super::database::DatabaseInner;
use super::raw::RawStatement;
use super::result_set::ResultSet;
use crate::error::{DatabaseError, Result};
use crate::reference::StatementRef;

/// A compiled statement ready for repeated execution.
pub struct PreparedStatement {
    db: Arc<DatabaseInner>,
    sql: String,
    reference: StatementRef<RawStatement>,
    /// Positional values, one per parameter
    parameters: Vec<Value>,
    closed: bool,
}

impl PreparedStatement {
    pub(crate) fn new(
        db: Arc<DatabaseInner>,
        sql: &str,
        reference: StatementRef<RawStatement>,
    ) -> Result<Self> {
        let parameter_count = reference.perform(|stmt| stmt.parameter_count())?;
        Ok(Self {
            db,
            sql: sql.to_string(),
            reference,
            parameters: vec![Value::Null; parameter_count],
            closed: false,
        })
    }

    /// Statement text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of parameters the statement takes.
    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bind positional parameter values, replacing any previous bindings.
    pub fn bind_parameters(&mut self, params: &[Value]) -> Result<()> {
        self.ensure_open()?;
        check_parameter_count(self.parameters.len(), params.len())?;
        self.parameters = params.to_vec();
        Ok(())
    }

    /// Bind values by parameter name (`:name`, `@name` or `$name`).
    ///
    /// Parameters not named keep their current value.
    pub fn bind_named(&mut self, params: &[(&str, Value)]) -> Result<()> {
        self.ensure_open()?;
        if !self.reference.is_valid() {
            self.reacquire()?;
        }

        let indexes = self.reference.perform(|stmt| {
            params
                .iter()
                .map(|(name, _)| stmt.parameter_index(name).ok_or(*name))
                .collect::<std::result::Result<Vec<_>, _>>()
        })?;
        let indexes =
            indexes.map_err(|name| DatabaseError::UnknownParameter(name.to_string()))?;

        for (index, (_, value)) in indexes.into_iter().zip(params) {
            self.parameters[index - 1] = value.clone();
        }
        Ok(())
    }

    /// Execute a statement that returns no rows.
    ///
    /// Returns the number of rows changed.
    pub fn execute_update(&mut self) -> Result<u64> {
        self.ensure_exclusive()?;
        let changes = self
            .reference
            .perform(|stmt| run_update(stmt, &self.parameters))??;
        Ok(changes)
    }

    /// Execute the statement and return a cursor over its rows.
    ///
    /// A cursor from a previous execution that is still open is invalidated.
    pub fn execute_query(&mut self) -> Result<ResultSet> {
        self.ensure_exclusive()?;
        self.reference
            .perform(|stmt| bind_all(stmt, &self.parameters))??;
        ResultSet::new(self.reference.clone_ref())
    }

    /// Execute the statement and pass each row to `visit`.
    ///
    /// See [`ResultSet::for_each_row`]; the cursor is closed on every exit
    /// path and the statement stays usable afterwards.
    pub fn enumerate<F>(&mut self, visit: F) -> Result<()>
    where
        F: FnMut(&ResultSet) -> Result<ControlFlow<()>>,
    {
        self.execute_query()?.for_each_row(visit)
    }

    /// Close the statement.
    ///
    /// Cursors executed from it are invalidated. Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
        self.reference.invalidate();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(DatabaseError::StatementClosed)
        } else {
            Ok(())
        }
    }

    /// Make sure this statement alone holds a live handle.
    fn ensure_exclusive(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.reference.is_valid() && !self.reference.is_shared() {
            return Ok(());
        }
        self.reacquire()
    }

    fn reacquire(&mut self) -> Result<()> {
        // Release first so the handle can come straight back from the pool.
        self.reference.invalidate();
        self.reference = self.db.acquire(&self.sql)?;
        Ok(())
    }
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("sql", &self.sql)
            .field("parameters", &self.parameters)
            .field("closed", &self.closed)
            .finish()
    }
}

pub(crate) fn check_parameter_count(expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(DatabaseError::ParameterCount { expected, found })
    }
}

/// Rewind `stmt` and bind `params` positionally.
pub(crate) fn bind_all(stmt: &mut RawStatement, params: &[Value]) -> rusqlite::Result<()> {
    stmt.rewind();
    for (index, value) in params.iter().enumerate() {
        stmt.bind(index + 1, value)?;
    }
    Ok(())
}

fn run_update(stmt: &mut RawStatement, params: &[Value]) -> rusqlite::Result<u64> {
    bind_all(stmt, params)?;
    let outcome = stmt.execute();
    stmt.rewind();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::Database;
    use pretty_assertions::assert_eq;

    fn database() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.execute_update("CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER)", &[])
            .unwrap();
        db
    }

    #[test]
    fn test_parameter_count_checked() {
        let db = database();
        let mut stmt = db
            .prepare_statement("INSERT INTO kv (k, v) VALUES (?, ?)")
            .unwrap();
        assert_eq!(stmt.parameter_count(), 2);

        let err = stmt
            .bind_parameters(&[Value::Text("a".to_string())])
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::ParameterCount {
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn test_bind_named() {
        let db = database();
        let mut stmt = db
            .prepare_statement("INSERT INTO kv (k, v) VALUES (:k, :v)")
            .unwrap();

        stmt.bind_named(&[(":v", Value::Integer(3)), (":k", Value::Text("x".to_string()))])
            .unwrap();
        assert_eq!(stmt.execute_update().unwrap(), 1);

        let mut rows = db.execute_query("SELECT v FROM kv WHERE k = 'x'", &[]).unwrap();
        assert!(rows.next().unwrap());
        assert_eq!(rows.get_i64(0).unwrap(), 3);
    }

    #[test]
    fn test_bind_named_unknown() {
        let db = database();
        let mut stmt = db
            .prepare_statement("INSERT INTO kv (k, v) VALUES (:k, :v)")
            .unwrap();
        let err = stmt
            .bind_named(&[(":nope", Value::Integer(1))])
            .unwrap_err();
        assert!(matches!(err, DatabaseError::UnknownParameter(name) if name == ":nope"));
    }

    #[test]
    fn test_closed_statement_rejects_work() {
        let db = database();
        let mut stmt = db.prepare_statement("SELECT 1").unwrap();
        stmt.close();
        stmt.close();

        assert!(stmt.is_closed());
        assert!(matches!(
            stmt.execute_query(),
            Err(DatabaseError::StatementClosed)
        ));
        assert!(matches!(
            stmt.bind_parameters(&[]),
            Err(DatabaseError::StatementClosed)
        ));
    }

    #[test]
    fn test_update_reports_constraint_violation() {
        let db = database();
        let mut stmt = db
            .prepare_statement("INSERT INTO kv (k, v) VALUES (?, ?)")
            .unwrap();
        stmt.bind_parameters(&[Value::Text("dup".to_string()), Value::Integer(1)])
            .unwrap();
        stmt.execute_update().unwrap();

        let err = stmt.execute_update().unwrap_err();
        assert!(matches!(err, DatabaseError::Sqlite(_)));

        // The statement stays usable after an engine error
        stmt.bind_parameters(&[Value::Text("other".to_string()), Value::Integer(2)])
            .unwrap();
        assert_eq!(stmt.execute_update().unwrap(), 1);
    }
}
