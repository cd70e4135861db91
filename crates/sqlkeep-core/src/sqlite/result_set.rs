//! Result cursors

use std::ops::ControlFlow;

use rusqlite::types::Value;

use super::raw::{RawStatement, Step};
use crate::error::{DatabaseError, Result};
use crate::reference::StatementRef;

/// A column addressed by position or by name.
pub trait ColumnIndex {
    /// Resolve to a zero-based column position within `rows`.
    fn column_index(&self, rows: &ResultSet) -> Result<usize>;
}

impl ColumnIndex for usize {
    fn column_index(&self, rows: &ResultSet) -> Result<usize> {
        if *self < rows.columns.len() {
            Ok(*self)
        } else {
            Err(DatabaseError::ColumnOutOfRange {
                index: *self,
                count: rows.columns.len(),
            })
        }
    }
}

impl ColumnIndex for &str {
    fn column_index(&self, rows: &ResultSet) -> Result<usize> {
        rows.column_index(self)
    }
}

/// A cursor over the rows of an executed query.
///
/// Holds a node of the statement's reference tree; once the statement or the
/// database is closed every access fails with
/// [`DatabaseError::HandleInvalidated`].
pub struct ResultSet {
    reference: StatementRef<RawStatement>,
    columns: Vec<String>,
    on_row: bool,
    exhausted: bool,
}

impl ResultSet {
    pub(crate) fn new(reference: StatementRef<RawStatement>) -> Result<Self> {
        let columns = reference.perform(|stmt| {
            (0..stmt.column_count())
                .map(|index| stmt.column_name(index).unwrap_or_default())
                .collect()
        })?;
        Ok(Self {
            reference,
            columns,
            on_row: false,
            exhausted: false,
        })
    }

    /// Advance to the next row.
    ///
    /// Returns `false` once all rows have been read.
    pub fn next(&mut self) -> Result<bool> {
        let exhausted = self.exhausted;
        let step = self.reference.perform(|stmt| {
            if exhausted {
                return Ok(Step::Done);
            }
            let step = stmt.step();
            if !matches!(step, Ok(Step::Row)) {
                stmt.rewind();
            }
            step
        })?;

        match step {
            Ok(Step::Row) => {
                self.on_row = true;
                Ok(true)
            }
            Ok(Step::Done) => {
                self.on_row = false;
                self.exhausted = true;
                Ok(false)
            }
            Err(e) => {
                self.on_row = false;
                Err(e.into())
            }
        }
    }

    /// Visit every remaining row, then close the cursor.
    ///
    /// `visit` returns `ControlFlow::Break(())` to stop early. The cursor is
    /// closed however iteration ends, including when `visit` or a step fails,
    /// so its compiled statement goes back to the cache.
    pub fn for_each_row<F>(mut self, mut visit: F) -> Result<()>
    where
        F: FnMut(&ResultSet) -> Result<ControlFlow<()>>,
    {
        let outcome = self.visit_rows(&mut visit);
        self.close();
        outcome
    }

    fn visit_rows<F>(&mut self, visit: &mut F) -> Result<()>
    where
        F: FnMut(&ResultSet) -> Result<ControlFlow<()>>,
    {
        while self.next()? {
            if visit(&*self)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Number of columns in the result.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Column names in result order.
    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Position of the column called `name` (ASCII case-insensitive).
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
            .ok_or_else(|| DatabaseError::UnknownColumn(name.to_string()))
    }

    /// Value of a column in the current row.
    pub fn value<C: ColumnIndex>(&self, column: C) -> Result<Value> {
        let index = column.column_index(self)?;
        if !self.on_row {
            // A closed cursor reports the invalidation, not a missing row.
            self.reference.perform(|_| ())?;
            return Err(DatabaseError::NoCurrentRow);
        }
        Ok(self.reference.perform(|stmt| stmt.column_value(index))?)
    }

    /// Whether a column in the current row is NULL.
    pub fn is_null<C: ColumnIndex>(&self, column: C) -> Result<bool> {
        Ok(matches!(self.value(column)?, Value::Null))
    }

    pub fn get_i64<C: ColumnIndex>(&self, column: C) -> Result<i64> {
        let index = column.column_index(self)?;
        match self.value(index)? {
            Value::Integer(i) => Ok(i),
            other => Err(type_mismatch(index, "integer", &other)),
        }
    }

    pub fn get_i32<C: ColumnIndex>(&self, column: C) -> Result<i32> {
        let index = column.column_index(self)?;
        let value = self.get_i64(index)?;
        i32::try_from(value)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(index, value).into())
    }

    /// Integer columns widen to `f64`.
    pub fn get_f64<C: ColumnIndex>(&self, column: C) -> Result<f64> {
        let index = column.column_index(self)?;
        match self.value(index)? {
            Value::Real(r) => Ok(r),
            Value::Integer(i) => Ok(i as f64),
            other => Err(type_mismatch(index, "real", &other)),
        }
    }

    /// Nonzero integers are `true`.
    pub fn get_bool<C: ColumnIndex>(&self, column: C) -> Result<bool> {
        Ok(self.get_i64(column)? != 0)
    }

    pub fn get_string<C: ColumnIndex>(&self, column: C) -> Result<String> {
        let index = column.column_index(self)?;
        match self.value(index)? {
            Value::Text(text) => Ok(text),
            other => Err(type_mismatch(index, "text", &other)),
        }
    }

    pub fn get_blob<C: ColumnIndex>(&self, column: C) -> Result<Vec<u8>> {
        let index = column.column_index(self)?;
        match self.value(index)? {
            Value::Blob(blob) => Ok(blob),
            other => Err(type_mismatch(index, "blob", &other)),
        }
    }

    /// Whether the cursor can no longer be used.
    pub fn is_closed(&self) -> bool {
        !self.reference.is_valid()
    }

    /// Close the cursor, releasing the compiled statement.
    ///
    /// The statement it was executed from is invalidated too and acquires a
    /// fresh handle on its next execution. Idempotent.
    pub fn close(&mut self) {
        self.on_row = false;
        self.reference.invalidate();
    }
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("sql", &self.reference.sql())
            .field("columns", &self.columns)
            .field("on_row", &self.on_row)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

fn storage_class(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Integer(_) => "integer",
        Value::Real(_) => "real",
        Value::Text(_) => "text",
        Value::Blob(_) => "blob",
    }
}

fn type_mismatch(column: usize, expected: &'static str, found: &Value) -> DatabaseError {
    DatabaseError::ColumnType {
        column,
        expected,
        found: storage_class(found),
    }
}
