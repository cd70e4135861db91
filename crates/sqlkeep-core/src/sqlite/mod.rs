//! SQLite Connection Layer
//!
//! Binds the statement cache and reference trees to a SQLite connection:
//!
//! ```text
//! Database
//! ├── Connection (serialized threading mode)
//! └── StatementCache<RawStatement>
//!     ├── idle statements, keyed by text
//!     └── registry of every statement handed out
//!
//! PreparedStatement ── owner node ─┐
//!                                  ├── one reference tree per compiled statement
//! ResultSet ────────── clone node ─┘
//! ```
//!
//! Closing a statement, its cursor, or the database invalidates the affected
//! trees; later use reports `HandleInvalidated` instead of touching a
//! finalized statement.

mod database;
pub mod raw;
mod result_set;
mod statement;

pub use database::Database;
pub use raw::{RawStatement, Step};
pub use result_set::{ColumnIndex, ResultSet};
pub use statement::PreparedStatement;
