//! Compiled query abstraction
//!
//! A compiled query is the engine-side product of parsing statement text:
//! expensive to build, cheap to run again, and disposed exactly once.
//! Disposal is the value's `Drop`, so ownership moving between the
//! statement cache and a reference tree is what guarantees a single
//! disposal.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// An owned, engine-compiled statement.
pub trait CompiledQuery: Send + 'static {
    /// Return the query to its initial bound-parameter state.
    ///
    /// Called before an idle query is made available for reuse.
    fn reset(&mut self);
}

static NEXT_STATEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one physical compiled query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementId(u64);

impl StatementId {
    /// Allocate a fresh identifier.
    pub(crate) fn next() -> Self {
        Self(NEXT_STATEMENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt#{}", self.0)
    }
}
